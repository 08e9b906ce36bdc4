//! Durable record store boundary.
//!
//! The engine assumes a durable record store and builds its coordination
//! logic on top. Two implementations: [`MemoryStore`] for tests and local
//! runs, and the Postgres-backed [`crate::db::Db`].
//!
//! Implementations must:
//! - reject a second event with an existing id (returning the original)
//! - keep `(job id, job version, event id)` unique across executions
//! - keep `(execution id, idempotency key)` unique across tasks
//! - apply execution transitions only when the stored state equals `from`
//! - grant a task lease to at most one claimant at a time
//! - return tasks in creation order

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{
    EventId, EventLog, Execution, ExecutionId, ExecutionPatch, ExecutionState, JobRef, Task,
    TaskId,
};

/// Outcome of an insert guarded by a uniqueness constraint.
#[derive(Debug, Clone)]
pub enum Inserted<T> {
    /// The record was written.
    New(T),
    /// A record with the same unique key already existed; it is returned
    /// unchanged.
    Existing(T),
}

impl<T> Inserted<T> {
    pub fn is_new(&self) -> bool {
        matches!(self, Inserted::New(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Inserted::New(t) | Inserted::Existing(t) => t,
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    // --- events ---

    async fn insert_event(&self, event: &EventLog) -> Result<Inserted<EventLog>>;

    async fn get_event(&self, id: &EventId) -> Result<EventLog>;

    /// Undelivered events due at `now`, earliest first.
    async fn due_events(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<EventLog>>;

    async fn mark_event_delivered(&self, id: &EventId, at: DateTime<Utc>) -> Result<()>;

    /// Push an undelivered event back into the schedule after a failed
    /// delivery attempt.
    async fn reschedule_event(
        &self,
        id: &EventId,
        deliver_at: DateTime<Utc>,
        attempts: u32,
        error: &str,
    ) -> Result<()>;

    // --- executions ---

    async fn insert_execution(&self, execution: &Execution) -> Result<Inserted<Execution>>;

    async fn get_execution(&self, id: &ExecutionId) -> Result<Execution>;

    /// Transition with optimistic concurrency: fails with
    /// [`Error::InvalidTransition`] unless the stored state is `from`.
    async fn transition_execution(
        &self,
        id: &ExecutionId,
        from: ExecutionState,
        to: ExecutionState,
        patch: ExecutionPatch,
    ) -> Result<Execution>;

    /// Update bookkeeping fields without changing state. Fails unless the
    /// stored state is `expected`.
    async fn patch_execution(
        &self,
        id: &ExecutionId,
        expected: ExecutionState,
        patch: ExecutionPatch,
    ) -> Result<Execution>;

    async fn list_executions(&self, state: ExecutionState) -> Result<Vec<Execution>>;

    async fn list_executions_for_job(&self, job: &JobRef) -> Result<Vec<Execution>>;

    // --- tasks ---

    async fn insert_task(&self, task: &Task) -> Result<Inserted<Task>>;

    async fn find_task(&self, execution_id: &ExecutionId, key: &str) -> Result<Option<Task>>;

    async fn get_task(&self, id: &TaskId) -> Result<Task>;

    /// Overwrite a task's mutable fields: status, output, error, attempts,
    /// completion time, lease and display data.
    async fn update_task(&self, task: &Task) -> Result<()>;

    /// Take the lease on `task` for `owner` and move it to RUNNING with one
    /// more attempt.
    ///
    /// Applies only while the stored status and attempts still equal
    /// `task`'s and no other owner holds a lease that is live at `now`.
    /// Returns `None` when the claim lost.
    async fn claim_task(
        &self,
        task: &Task,
        owner: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>>;

    /// Extend a lease `owner` still holds on a RUNNING task. `false` means the
    /// lease is gone.
    async fn renew_task_lease(
        &self,
        id: &TaskId,
        owner: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<bool>;

    /// All tasks of an execution in creation order.
    async fn list_tasks(&self, execution_id: &ExecutionId) -> Result<Vec<Task>>;
}

/// Validate an execution state transition, returning an error if disallowed.
pub(crate) fn validate_transition(from: ExecutionState, to: ExecutionState) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
