//! Versioned job definitions and their event triggers.

use serde::{Deserialize, Serialize};

use super::event::RawEvent;

/// A job is immutable per version. A new version is a distinct record
/// sharing `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub name: String,
    pub version: String,
    pub trigger: EventTrigger,
    #[serde(default)]
    pub connections: Vec<JobConnection>,
    #[serde(default)]
    pub supports_preparation: bool,
}

impl Job {
    pub fn job_ref(&self) -> JobRef {
        JobRef {
            id: self.id.clone(),
            version: self.version.clone(),
        }
    }
}

/// `(id, version)` pair pinning an execution to one job definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobRef {
    pub id: String,
    pub version: String,
}

impl std::fmt::Display for JobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// Trigger metadata: which events start this job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTrigger {
    /// Event name to match exactly.
    pub event: String,
    /// Event source to match exactly. `None` matches any source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Payload filter. Each key maps to an array of accepted values or to a
    /// nested filter object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<serde_json::Value>,
}

impl EventTrigger {
    pub fn matches(&self, event: &RawEvent) -> bool {
        if self.event != event.name {
            return false;
        }
        if let Some(ref source) = self.source
            && *source != event.source
        {
            return false;
        }
        match self.filter {
            Some(ref filter) => filter_matches(filter, &event.payload),
            None => true,
        }
    }
}

fn filter_matches(filter: &serde_json::Value, payload: &serde_json::Value) -> bool {
    use serde_json::Value;

    let Value::Object(rules) = filter else {
        return false;
    };
    rules.iter().all(|(key, rule)| {
        let Some(actual) = payload.get(key) else {
            return false;
        };
        match rule {
            Value::Array(accepted) => accepted.iter().any(|v| v == actual),
            Value::Object(_) => filter_matches(rule, actual),
            _ => false,
        }
    })
}

/// A connection the job declares it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConnection {
    pub key: String,
    #[serde(default)]
    pub metadata: ConnectionMetadata,
    #[serde(default)]
    pub uses_local_auth: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetadata {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}
