//! Tasks: idempotency-keyed units of side-effecting work within an execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ExecutionId, TaskId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub execution_id: ExecutionId,
    pub name: String,
    /// Unique within one execution.
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_until: Option<DateTime<Utc>>,
    /// Pure checkpoint: recorded for replay, no side effect.
    #[serde(default)]
    pub noop: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elements: Option<Vec<DisplayProperty>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Number of times the side effect has been invoked.
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Ledger instance holding the right to run the side effect. Store-side
    /// only; never crosses the worker boundary.
    #[serde(skip)]
    pub claimed_by: Option<String>,
    #[serde(skip)]
    pub lease_until: Option<DateTime<Utc>>,
}

impl Task {
    /// Replay form handed to the worker.
    pub fn to_cached(&self) -> CachedTask {
        CachedTask {
            id: self.id.clone(),
            idempotency_key: self.idempotency_key.clone(),
            status: self.status,
            noop: self.noop,
            params: self.params.clone(),
            output: self.output.clone(),
        }
    }

    /// Whether someone other than `owner` holds an unexpired lease.
    pub fn leased_elsewhere(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Running
            && self.claimed_by.as_deref().is_some_and(|holder| holder != owner)
            && self.lease_until.is_some_and(|until| until > now)
    }

    pub(crate) fn release_lease(&mut self) {
        self.claimed_by = None;
        self.lease_until = None;
    }
}

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting for a deadline (`delay_until`) or an external completion.
    Pending,
    /// Side effect in flight.
    Running,
    Completed,
    Errored,
}

impl TaskStatus {
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Completed)
                | (Running, Completed)
                | (Running, Errored)
                | (Running, Running) // crashed attempt re-invoked
                | (Errored, Running) // re-attempt on a later run
        )
    }

    /// How far along the lifecycle a status is. A record is never replaced
    /// by a copy of lower progress.
    pub fn progress(self) -> u8 {
        match self {
            TaskStatus::Pending | TaskStatus::Running => 0,
            TaskStatus::Errored => 1,
            TaskStatus::Completed => 2,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Errored => "ERRORED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "RUNNING" => Ok(TaskStatus::Running),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "ERRORED" => Ok(TaskStatus::Errored),
            _ => Err(crate::error::Error::Other(format!("unknown task status: {s}"))),
        }
    }
}

/// A completed task as seen by a replaying worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedTask {
    pub id: TaskId,
    pub idempotency_key: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub noop: bool,
    /// Params the task was recorded with; a replay with different params is
    /// a conflict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

/// Failure reported by a side effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl TaskFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Label/value pair rendered alongside a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayProperty {
    pub label: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}
