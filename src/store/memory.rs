//! In-memory store.
//!
//! Intended for tests and local runs. Mirrors the uniqueness and ordering
//! guarantees of the Postgres store; nothing survives a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::{Inserted, Store, validate_transition};
use crate::error::{Error, Result};
use crate::model::{
    EventId, EventLog, Execution, ExecutionId, ExecutionPatch, ExecutionState, JobRef, Task,
    TaskId, TaskStatus,
};

#[derive(Debug, Default)]
struct Inner {
    events: HashMap<EventId, EventLog>,
    /// Undelivered events ordered by due time.
    schedule: BTreeSet<(DateTime<Utc>, EventId)>,

    executions: HashMap<ExecutionId, Execution>,
    /// (job, event) -> execution, for creation dedup.
    execution_keys: HashMap<(JobRef, EventId), ExecutionId>,

    /// Tasks per execution, in creation order.
    tasks: HashMap<ExecutionId, Vec<Task>>,
    task_index: HashMap<TaskId, ExecutionId>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Other("store lock poisoned".to_string()))
    }
}

fn due_time(event: &EventLog) -> DateTime<Utc> {
    event.deliver_at.unwrap_or(event.created_at)
}

/// Resolved auth is never persisted.
fn persisted(execution: &Execution) -> Execution {
    let mut record = execution.clone();
    record.connections.clear();
    record
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_event(&self, event: &EventLog) -> Result<Inserted<EventLog>> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner.events.get(event.id()) {
            return Ok(Inserted::Existing(existing.clone()));
        }
        if event.delivered_at.is_none() {
            inner.schedule.insert((due_time(event), event.id().clone()));
        }
        inner.events.insert(event.id().clone(), event.clone());
        Ok(Inserted::New(event.clone()))
    }

    async fn get_event(&self, id: &EventId) -> Result<EventLog> {
        self.lock()?
            .events
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("event {id}")))
    }

    async fn due_events(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<EventLog>> {
        let inner = self.lock()?;
        Ok(inner
            .schedule
            .iter()
            .take_while(|(at, _)| *at <= now)
            .take(limit)
            .filter_map(|(_, id)| inner.events.get(id).cloned())
            .collect())
    }

    async fn mark_event_delivered(&self, id: &EventId, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock()?;
        let event = inner
            .events
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("event {id}")))?;
        let due = due_time(event);
        event.delivered_at = Some(at);
        inner.schedule.remove(&(due, id.clone()));
        Ok(())
    }

    async fn reschedule_event(
        &self,
        id: &EventId,
        deliver_at: DateTime<Utc>,
        attempts: u32,
        error: &str,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let event = inner
            .events
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("event {id}")))?;
        let old_due = due_time(event);
        event.deliver_at = Some(deliver_at);
        event.delivery_attempts = attempts;
        event.last_error = Some(error.to_string());
        inner.schedule.remove(&(old_due, id.clone()));
        inner.schedule.insert((deliver_at, id.clone()));
        Ok(())
    }

    async fn insert_execution(&self, execution: &Execution) -> Result<Inserted<Execution>> {
        let mut inner = self.lock()?;
        let key = (execution.job.clone(), execution.event.id.clone());
        if let Some(existing_id) = inner.execution_keys.get(&key)
            && let Some(existing) = inner.executions.get(existing_id)
        {
            return Ok(Inserted::Existing(existing.clone()));
        }
        let record = persisted(execution);
        inner.execution_keys.insert(key, record.id.clone());
        inner.executions.insert(record.id.clone(), record.clone());
        Ok(Inserted::New(record))
    }

    async fn get_execution(&self, id: &ExecutionId) -> Result<Execution> {
        self.lock()?
            .executions
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("execution {id}")))
    }

    async fn transition_execution(
        &self,
        id: &ExecutionId,
        from: ExecutionState,
        to: ExecutionState,
        patch: ExecutionPatch,
    ) -> Result<Execution> {
        validate_transition(from, to)?;

        let mut inner = self.lock()?;
        let execution = inner
            .executions
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("execution {id}")))?;
        if execution.state != from {
            return Err(Error::InvalidTransition {
                from: execution.state.to_string(),
                to: to.to_string(),
            });
        }
        patch.apply(execution, to, Utc::now());
        Ok(execution.clone())
    }

    async fn patch_execution(
        &self,
        id: &ExecutionId,
        expected: ExecutionState,
        patch: ExecutionPatch,
    ) -> Result<Execution> {
        let mut inner = self.lock()?;
        let execution = inner
            .executions
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("execution {id}")))?;
        if execution.state != expected {
            return Err(Error::InvalidTransition {
                from: execution.state.to_string(),
                to: expected.to_string(),
            });
        }
        patch.apply(execution, expected, Utc::now());
        Ok(execution.clone())
    }

    async fn list_executions(&self, state: ExecutionState) -> Result<Vec<Execution>> {
        let inner = self.lock()?;
        let mut executions: Vec<Execution> = inner
            .executions
            .values()
            .filter(|e| e.state == state)
            .cloned()
            .collect();
        executions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(executions)
    }

    async fn list_executions_for_job(&self, job: &JobRef) -> Result<Vec<Execution>> {
        let inner = self.lock()?;
        let mut executions: Vec<Execution> = inner
            .executions
            .values()
            .filter(|e| e.job == *job)
            .cloned()
            .collect();
        executions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(executions)
    }

    async fn insert_task(&self, task: &Task) -> Result<Inserted<Task>> {
        let mut inner = self.lock()?;
        let tasks = inner.tasks.entry(task.execution_id.clone()).or_default();
        if let Some(existing) = tasks
            .iter()
            .find(|t| t.idempotency_key == task.idempotency_key)
        {
            return Ok(Inserted::Existing(existing.clone()));
        }
        tasks.push(task.clone());
        inner
            .task_index
            .insert(task.id.clone(), task.execution_id.clone());
        Ok(Inserted::New(task.clone()))
    }

    async fn find_task(&self, execution_id: &ExecutionId, key: &str) -> Result<Option<Task>> {
        let inner = self.lock()?;
        Ok(inner
            .tasks
            .get(execution_id)
            .and_then(|tasks| tasks.iter().find(|t| t.idempotency_key == key))
            .cloned())
    }

    async fn get_task(&self, id: &TaskId) -> Result<Task> {
        let inner = self.lock()?;
        inner
            .task_index
            .get(id)
            .and_then(|execution_id| inner.tasks.get(execution_id))
            .and_then(|tasks| tasks.iter().find(|t| t.id == *id))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task {id}")))
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut inner = self.lock()?;
        let stored = inner
            .tasks
            .get_mut(&task.execution_id)
            .and_then(|tasks| tasks.iter_mut().find(|t| t.id == task.id))
            .ok_or_else(|| Error::NotFound(format!("task {}", task.id)))?;
        stored.status = task.status;
        stored.output = task.output.clone();
        stored.error = task.error.clone();
        stored.attempts = task.attempts;
        stored.completed_at = task.completed_at;
        stored.claimed_by = task.claimed_by.clone();
        stored.lease_until = task.lease_until;
        stored.elements = task.elements.clone();
        stored.description = task.description.clone();
        Ok(())
    }

    async fn claim_task(
        &self,
        task: &Task,
        owner: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let mut inner = self.lock()?;
        let stored = inner
            .tasks
            .get_mut(&task.execution_id)
            .and_then(|tasks| tasks.iter_mut().find(|t| t.id == task.id))
            .ok_or_else(|| Error::NotFound(format!("task {}", task.id)))?;
        if stored.status != task.status
            || stored.attempts != task.attempts
            || stored.leased_elsewhere(owner, now)
        {
            return Ok(None);
        }
        stored.status = TaskStatus::Running;
        stored.attempts += 1;
        stored.error = None;
        stored.claimed_by = Some(owner.to_string());
        stored.lease_until = Some(lease_until);
        Ok(Some(stored.clone()))
    }

    async fn renew_task_lease(
        &self,
        id: &TaskId,
        owner: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        let Some(execution_id) = inner.task_index.get(id).cloned() else {
            return Err(Error::NotFound(format!("task {id}")));
        };
        let Some(stored) = inner
            .tasks
            .get_mut(&execution_id)
            .and_then(|tasks| tasks.iter_mut().find(|t| t.id == *id))
        else {
            return Err(Error::NotFound(format!("task {id}")));
        };
        if stored.status != TaskStatus::Running || stored.claimed_by.as_deref() != Some(owner) {
            return Ok(false);
        }
        stored.lease_until = Some(lease_until);
        Ok(true)
    }

    async fn list_tasks(&self, execution_id: &ExecutionId) -> Result<Vec<Task>> {
        Ok(self
            .lock()?
            .tasks
            .get(execution_id)
            .cloned()
            .unwrap_or_default())
    }
}
