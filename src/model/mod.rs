//! Core data model.
//!
//! Events trigger versioned jobs. Each (job version, event) pair becomes an
//! execution, and an execution records its side effects as tasks keyed by a
//! caller-assigned idempotency key.

pub mod connection;
pub mod event;
pub mod execution;
pub mod ids;
pub mod job;
pub mod secure_string;
pub mod task;

pub use connection::{ConnectionAuth, Credential};
pub use event::{EventLog, RawEvent};
pub use execution::{Execution, ExecutionContext, ExecutionError, ExecutionPatch, ExecutionState};
pub use ids::{EventId, ExecutionId, IdGenerator, SequentialIdGenerator, TaskId, UuidV7Generator};
pub use job::{ConnectionMetadata, EventTrigger, Job, JobConnection, JobRef};
pub use secure_string::SecureString;
pub use task::{CachedTask, DisplayProperty, Task, TaskFailure, TaskStatus};
