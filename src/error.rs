//! Error types for jobrun-rs.
//!
//! Every error maps onto an [`ErrorKind`]. Whether a failure is retried is a
//! property of its kind, never of the message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed envelope, rejected at the boundary.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Same idempotency key replayed with different params.
    #[error("idempotency conflict on task {key} in execution {execution_id}")]
    IdempotencyConflict { execution_id: String, key: String },

    #[error("cannot resolve auth for connection {connection}: {source}")]
    AuthResolution {
        connection: String,
        #[source]
        source: Box<Error>,
    },

    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("auth for connection {key} expired at {expired_at}")]
    AuthExpired {
        key: String,
        expired_at: chrono::DateTime<chrono::Utc>,
    },

    /// The user side effect reported a failure.
    #[error("task {key} failed: {message}")]
    TaskExecution { key: String, message: String },

    /// Transient delivery failure (worker unavailable, transport error).
    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// The owning execution is terminal; no further side effects may run.
    #[error("execution {0} has already finished")]
    ExecutionFinished(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("database error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of failures, carried across the worker boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    IdempotencyConflict,
    AuthResolution,
    ConnectionNotFound,
    AuthExpired,
    TaskExecution,
    Delivery,
    Aborted,
    Internal,
}

impl ErrorKind {
    /// Retryable kinds re-enter RUNNING with backoff; everything else is fatal.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Delivery | ErrorKind::TaskExecution)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::IdempotencyConflict => "idempotency_conflict",
            ErrorKind::AuthResolution => "auth_resolution",
            ErrorKind::ConnectionNotFound => "connection_not_found",
            ErrorKind::AuthExpired => "auth_expired",
            ErrorKind::TaskExecution => "task_execution",
            ErrorKind::Delivery => "delivery",
            ErrorKind::Aborted => "aborted",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::IdempotencyConflict { .. } => ErrorKind::IdempotencyConflict,
            Error::AuthResolution { .. } => ErrorKind::AuthResolution,
            Error::ConnectionNotFound(_) => ErrorKind::ConnectionNotFound,
            Error::AuthExpired { .. } => ErrorKind::AuthExpired,
            Error::TaskExecution { .. } => ErrorKind::TaskExecution,
            Error::Delivery(_) => ErrorKind::Delivery,
            Error::ExecutionFinished(_) => ErrorKind::Aborted,
            Error::NotFound(_)
            | Error::InvalidTransition { .. }
            | Error::Unauthorized(_)
            | Error::Storage(_)
            | Error::Serialization(_)
            | Error::Io(_)
            | Error::Config(_)
            | Error::Other(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}
