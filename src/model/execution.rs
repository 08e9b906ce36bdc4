//! Executions: one run of a specific job version against a specific event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::connection::ConnectionAuth;
use super::event::RawEvent;
use super::ids::ExecutionId;
use super::job::JobRef;
use crate::error::ErrorKind;

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: ExecutionId,
    /// Fixed at creation; never changes while the execution lives.
    pub job: JobRef,
    pub event: RawEvent,
    pub context: ExecutionContext,

    /// Resolved connection auth. Never persisted; filled in at creation and
    /// on every dispatch.
    #[serde(skip)]
    pub connections: HashMap<String, ConnectionAuth>,

    pub state: ExecutionState,
    /// Number of dispatch attempts that ended in a failure report.
    pub attempts: u32,
    /// When a retryable failure is due to be re-dispatched.
    pub retry_at: Option<DateTime<Utc>>,
    /// When a suspended execution becomes due. `None` while waiting on an
    /// external completion.
    pub resume_at: Option<DateTime<Utc>>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
    pub error: Option<ExecutionError>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Context handed to job code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub id: ExecutionId,
    pub environment: String,
    pub organization: String,
    pub is_test: bool,
    /// Job version this execution is pinned to.
    pub version: String,
    pub started_at: DateTime<Utc>,
}

/// Failure recorded on an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&crate::error::Error> for ExecutionError {
    fn from(err: &crate::error::Error) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Persisted, connections not yet resolved.
    Created,
    /// Dispatched to a worker, or waiting for a retry.
    Running,
    /// Parked on a delay or an external completion.
    Suspended,
    Completed,
    Failed,
}

impl ExecutionState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, to),
            (Created, Running)
                | (Created, Failed)     // auth resolution failed or aborted
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Suspended)
                | (Suspended, Running)  // delay elapsed or callback arrived
                | (Suspended, Failed) // aborted or abandoned
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionState::Completed | ExecutionState::Failed)
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionState::Created => "created",
            ExecutionState::Running => "running",
            ExecutionState::Suspended => "suspended",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ExecutionState {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "created" => Ok(ExecutionState::Created),
            "running" => Ok(ExecutionState::Running),
            "suspended" => Ok(ExecutionState::Suspended),
            "completed" => Ok(ExecutionState::Completed),
            "failed" => Ok(ExecutionState::Failed),
            _ => Err(crate::error::Error::Other(format!(
                "unknown execution state: {s}"
            ))),
        }
    }
}

/// Field updates applied together with a state transition.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPatch {
    pub attempts: Option<u32>,
    pub retry_at: Option<Option<DateTime<Utc>>>,
    pub resume_at: Option<Option<DateTime<Utc>>>,
    pub suspended_at: Option<Option<DateTime<Utc>>>,
    pub output: Option<serde_json::Value>,
    pub error: Option<ExecutionError>,
}

impl ExecutionPatch {
    /// Apply the patch and the new state to an in-memory record.
    pub fn apply(self, execution: &mut Execution, to: ExecutionState, now: DateTime<Utc>) {
        execution.state = to;
        execution.updated_at = now;
        if to.is_terminal() {
            execution.finished_at = Some(now);
        }
        if let Some(attempts) = self.attempts {
            execution.attempts = attempts;
        }
        if let Some(retry_at) = self.retry_at {
            execution.retry_at = retry_at;
        }
        if let Some(resume_at) = self.resume_at {
            execution.resume_at = resume_at;
        }
        if let Some(suspended_at) = self.suspended_at {
            execution.suspended_at = suspended_at;
        }
        if self.output.is_some() {
            execution.output = self.output;
        }
        if self.error.is_some() {
            execution.error = self.error;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_exits() {
        use ExecutionState::*;
        for from in [Completed, Failed] {
            for to in [Created, Running, Suspended, Completed, Failed] {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn suspension_round_trip_is_allowed() {
        use ExecutionState::*;
        assert!(Running.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Running));
        assert!(!Suspended.can_transition_to(Completed));
        assert!(!Created.can_transition_to(Suspended));
    }

    #[test]
    fn state_parses_its_display_form() {
        use ExecutionState::*;
        for state in [Created, Running, Suspended, Completed, Failed] {
            assert_eq!(state.to_string().parse::<ExecutionState>().unwrap(), state);
        }
    }
}
