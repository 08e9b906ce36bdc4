//! Boundary envelopes exchanged with workers and event senders.
//!
//! Field names are camelCase on the wire. Everything arriving from outside
//! passes through [`validate`] before it reaches the coordinator.

pub mod validate;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;

use crate::model::{
    CachedTask, ConnectionAuth, DisplayProperty, EventId, ExecutionContext, ExecutionId, JobRef,
    RawEvent, Task,
};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// An event as submitted, before defaults are applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEventInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EventId>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl RawEventInput {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: None,
            name: name.into(),
            source: None,
            payload,
            context: None,
            timestamp: None,
        }
    }

    pub fn id(mut self, id: impl Into<EventId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Apply defaults: generated id, configured source, current time.
    pub fn normalize(
        self,
        generate_id: impl FnOnce() -> String,
        default_source: &str,
        now: DateTime<Utc>,
    ) -> RawEvent {
        RawEvent {
            id: self.id.unwrap_or_else(|| EventId(generate_id())),
            name: self.name,
            source: self.source.unwrap_or_else(|| default_source.to_string()),
            payload: self.payload,
            context: self.context,
            timestamp: self.timestamp.unwrap_or(now),
        }
    }
}

/// Delivery scheduling. At most one of the two fields may be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEventOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_at: Option<DateTime<Utc>>,
    /// Seconds from now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_after: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEventBody {
    pub event: RawEventInput,
    #[serde(default)]
    pub options: SendEventOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEventResponse {
    pub id: EventId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_at: Option<DateTime<Utc>>,
    /// Set when the event was delivered as part of the send.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Request to create or replay a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTaskBodyInput {
    pub idempotency_key: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub noop: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elements: Option<Vec<DisplayProperty>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl RunTaskBodyInput {
    pub fn new(idempotency_key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            name: name.into(),
            params: None,
            delay_until: None,
            noop: false,
            elements: None,
            description: None,
        }
    }

    pub fn params(mut self, params: serde_json::Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn delay_until(mut self, at: DateTime<Utc>) -> Self {
        self.delay_until = Some(at);
        self
    }

    pub fn noop(mut self) -> Self {
        self.noop = true;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A task request after boundary normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTaskBodyOutput {
    pub idempotency_key: String,
    pub name: String,
    /// Explicit JSON `null` is normalized to absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub noop: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elements: Option<Vec<DisplayProperty>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl From<RunTaskBodyInput> for RunTaskBodyOutput {
    fn from(input: RunTaskBodyInput) -> Self {
        Self {
            idempotency_key: input.idempotency_key,
            name: input.name,
            params: input.params.filter(|p| !p.is_null()),
            delay_until: input.delay_until,
            noop: input.noop,
            elements: input.elements,
            description: input.description,
        }
    }
}

/// Marks a deferred task complete.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteTaskBodyInput {
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elements: Option<Vec<DisplayProperty>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Everything a worker needs to (re)run one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteJobBody {
    pub event: RawEvent,
    pub job: JobRef,
    pub context: ExecutionContext,
    /// Completed prefix from earlier attempts, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<CachedTask>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub connections: HashMap<String, ConnectionAuth>,
}

/// Worker's answer to a dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteJobResponse {
    pub execution_id: ExecutionId,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// The task the run stopped on when `completed` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
}

impl ExecuteJobResponse {
    pub fn completed(execution_id: ExecutionId, output: serde_json::Value) -> Self {
        Self {
            execution_id,
            completed: true,
            output: Some(output),
            task: None,
        }
    }

    pub fn interrupted(execution_id: ExecutionId, task: Task) -> Self {
        Self {
            execution_id,
            completed: false,
            output: None,
            task: Some(task),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedExecution {
    pub id: ExecutionId,
}

pub type CreateExecutionResponseBody = ApiResult<CreatedExecution>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepareForJobExecutionBody {
    pub id: String,
    pub version: String,
}

impl PrepareForJobExecutionBody {
    pub fn job_ref(&self) -> JobRef {
        JobRef {
            id: self.id.clone(),
            version: self.version.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareForJobExecutionResponse {
    pub ok: bool,
}

// ---------------------------------------------------------------------------
// Tagged result
// ---------------------------------------------------------------------------

/// `{ok: true, data}` or `{ok: false, error}`. Never both, never neither.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResult<T> {
    Ok(T),
    Err(String),
}

impl<T> ApiResult<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, ApiResult::Ok(_))
    }
}

impl<T> From<crate::error::Result<T>> for ApiResult<T> {
    fn from(result: crate::error::Result<T>) -> Self {
        match result {
            Ok(data) => ApiResult::Ok(data),
            Err(e) => ApiResult::Err(e.to_string()),
        }
    }
}

#[derive(Serialize)]
struct OkRef<'a, T> {
    ok: bool,
    data: &'a T,
}

#[derive(Serialize)]
struct ErrRef<'a> {
    ok: bool,
    error: &'a str,
}

#[derive(Deserialize)]
struct Tagged<T> {
    ok: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> Serialize for ApiResult<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ApiResult::Ok(data) => OkRef { ok: true, data }.serialize(serializer),
            ApiResult::Err(error) => ErrRef { ok: false, error }.serialize(serializer),
        }
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for ApiResult<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error as _;

        let tagged = Tagged::<T>::deserialize(deserializer)?;
        match (tagged.ok, tagged.data, tagged.error) {
            (true, Some(data), None) => Ok(ApiResult::Ok(data)),
            (false, None, Some(error)) => Ok(ApiResult::Err(error)),
            (true, _, _) => Err(D::Error::custom("ok result must carry only `data`")),
            (false, _, _) => Err(D::Error::custom("error result must carry only `error`")),
        }
    }
}
