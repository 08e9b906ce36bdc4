//! Task ledger: idempotent side effects within an execution.
//!
//! A task is identified by `(execution id, idempotency key)`. The first call
//! for a key records the task and runs its side effect once; later calls
//! with the same params get the recorded result back without running it
//! again. Params that differ from the recorded ones are a conflict.
//!
//! Within one process, concurrent calls for a key share a single flight.
//! Across processes the store arbitrates: the ledger running a side effect
//! holds a lease on the task and renews it while the effect runs. Other
//! ledgers wait for the holder's result and take over only once the lease
//! has lapsed.

pub mod flight;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Instrument, debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{
    CachedTask, ExecutionId, IdGenerator, Task, TaskFailure, TaskId, TaskStatus,
};
use crate::store::Store;
use crate::telemetry::execution::start_task_span;
use crate::telemetry::metrics;
use crate::wire::{CompleteTaskBodyInput, RunTaskBodyOutput};
use flight::{Flight, FlightTable};

/// What a task call resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    /// `cached` is true when the output came from an earlier run.
    Completed { task: Task, cached: bool },
    /// The side effect failed. Not retried by the ledger.
    Errored(Task),
    /// The execution must suspend. `resume_at` is `None` for tasks waiting
    /// on an external completion.
    Suspended {
        task: Task,
        resume_at: Option<DateTime<Utc>>,
    },
}

impl TaskResult {
    pub fn task(&self) -> &Task {
        match self {
            TaskResult::Completed { task, .. }
            | TaskResult::Errored(task)
            | TaskResult::Suspended { task, .. } => task,
        }
    }

    pub fn into_task(self) -> Task {
        match self {
            TaskResult::Completed { task, .. }
            | TaskResult::Errored(task)
            | TaskResult::Suspended { task, .. } => task,
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            TaskResult::Completed { cached: true, .. } => "cached",
            TaskResult::Completed { task, .. } if task.noop => "noop",
            TaskResult::Completed { .. } => "executed",
            TaskResult::Errored(_) => "errored",
            TaskResult::Suspended { .. } => "suspended",
        }
    }
}

/// How long a claim on a running task stays valid without renewal.
pub const DEFAULT_TASK_LEASE: Duration = Duration::from_secs(300);
/// How often a ledger checks on a task leased by another ledger.
pub const DEFAULT_TASK_POLL: Duration = Duration::from_millis(100);

pub struct TaskLedger {
    store: Arc<dyn Store>,
    ids: Arc<dyn IdGenerator>,
    flights: FlightTable,
    /// Lease holder name for this instance.
    owner: String,
    lease: Duration,
    poll_interval: Duration,
}

impl TaskLedger {
    pub fn new(store: Arc<dyn Store>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            store,
            ids,
            flights: FlightTable::new(),
            owner: format!("ledger-{}", Uuid::now_v7()),
            lease: DEFAULT_TASK_LEASE,
            poll_interval: DEFAULT_TASK_POLL,
        }
    }

    pub fn with_lease(mut self, lease: Duration, poll_interval: Duration) -> Self {
        self.lease = lease;
        self.poll_interval = poll_interval;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn lease_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.lease).unwrap_or_else(|_| chrono::Duration::days(1))
    }

    /// Run or replay one task.
    ///
    /// Concurrent calls for the same key share a single invocation of the
    /// side effect and all receive its result.
    pub async fn run_task<F, Fut>(
        &self,
        execution_id: &ExecutionId,
        request: RunTaskBodyOutput,
        side_effect: F,
    ) -> Result<TaskResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<serde_json::Value, TaskFailure>>,
    {
        let span = start_task_span(execution_id, &request.idempotency_key, &request.name);
        let record_span = span.clone();

        let result = async {
            let mut side_effect = Some(side_effect);
            loop {
                match self.flights.join(execution_id, &request.idempotency_key)? {
                    Flight::Follower(rx) => {
                        debug!("waiting on in-flight task");
                        let Some(result) = flight::wait(rx).await else {
                            // Leader failed or was cancelled; take over.
                            continue;
                        };
                        ensure_same_params(execution_id, result.task(), &request)?;
                        return Ok(result);
                    }
                    Flight::Leader(guard) => {
                        let effect = side_effect
                            .take()
                            .ok_or_else(|| Error::Other("side effect already consumed".into()))?;
                        let result = self.lead(execution_id, &request, effect).await?;
                        guard.finish(&result);
                        return Ok(result);
                    }
                }
            }
        }
        .instrument(span)
        .await;

        let outcome = match &result {
            Ok(r) => r.outcome(),
            Err(Error::IdempotencyConflict { .. }) => "conflict",
            Err(_) => "error",
        };
        record_span.record("task.outcome", outcome);
        metrics::task_outcomes().add(1, &[KeyValue::new("outcome", outcome)]);
        result
    }

    async fn lead<F, Fut>(
        &self,
        execution_id: &ExecutionId,
        request: &RunTaskBodyOutput,
        side_effect: F,
    ) -> Result<TaskResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<serde_json::Value, TaskFailure>>,
    {
        self.ensure_live(execution_id).await?;
        let now = Utc::now();

        let mut task = match self
            .store
            .find_task(execution_id, &request.idempotency_key)
            .await?
        {
            Some(existing) => existing,
            None => {
                let status = if request.noop {
                    TaskStatus::Completed
                } else if request.delay_until.is_some() {
                    TaskStatus::Pending
                } else {
                    TaskStatus::Running
                };
                let task = self.new_task(execution_id, request, status, now);
                let inserted = self.store.insert_task(&task).await?;
                if inserted.is_new() {
                    return match status {
                        TaskStatus::Completed => Ok(TaskResult::Completed {
                            task,
                            cached: false,
                        }),
                        TaskStatus::Pending => self.settle_pending(task, now).await,
                        _ => self.invoke(task, side_effect).await,
                    };
                }
                // Another process recorded the key first.
                inserted.into_inner()
            }
        };

        ensure_same_params(execution_id, &task, request)?;

        loop {
            let now = Utc::now();
            match task.status {
                TaskStatus::Completed => return Ok(TaskResult::Completed { task, cached: true }),
                TaskStatus::Pending => return self.settle_pending(task, now).await,
                TaskStatus::Running if task.leased_elsewhere(&self.owner, now) => {
                    if let Some(result) = self.await_holder(&task).await? {
                        return Ok(result);
                    }
                }
                TaskStatus::Running | TaskStatus::Errored => {
                    if task.status == TaskStatus::Running {
                        warn!(
                            task_id = %task.id,
                            attempts = task.attempts,
                            holder = ?task.claimed_by,
                            "task lease lapsed, invoking again"
                        );
                    } else {
                        info!(task_id = %task.id, attempts = task.attempts, "re-attempting errored task");
                    }
                    let lease_until = self.lease_deadline(now);
                    if let Some(claimed) = self
                        .store
                        .claim_task(&task, &self.owner, lease_until, now)
                        .await?
                    {
                        return self.invoke(claimed, side_effect).await;
                    }
                    debug!(task_id = %task.id, "task claimed by another ledger first");
                }
            }
            task = self.store.get_task(&task.id).await?;
        }
    }

    /// Wait for the ledger holding `task` to settle it. `None` when its lease
    /// lapses first.
    async fn await_holder(&self, task: &Task) -> Result<Option<TaskResult>> {
        debug!(task_id = %task.id, holder = ?task.claimed_by, "task running elsewhere, waiting");
        loop {
            tokio::time::sleep(self.poll_interval).await;
            let current = self.store.get_task(&task.id).await?;
            match current.status {
                TaskStatus::Completed => {
                    return Ok(Some(TaskResult::Completed {
                        task: current,
                        cached: true,
                    }));
                }
                TaskStatus::Errored => return Ok(Some(TaskResult::Errored(current))),
                TaskStatus::Running if current.leased_elsewhere(&self.owner, Utc::now()) => {}
                _ => return Ok(None),
            }
        }
    }

    fn new_task(
        &self,
        execution_id: &ExecutionId,
        request: &RunTaskBodyOutput,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Task {
        let leased = status == TaskStatus::Running;
        Task {
            id: TaskId(self.ids.next()),
            execution_id: execution_id.clone(),
            name: request.name.clone(),
            idempotency_key: request.idempotency_key.clone(),
            params: request.params.clone(),
            output: None,
            error: None,
            status,
            delay_until: request.delay_until,
            noop: request.noop,
            elements: request.elements.clone(),
            description: request.description.clone(),
            attempts: u32::from(status == TaskStatus::Running),
            created_at: now,
            completed_at: (status == TaskStatus::Completed).then_some(now),
            claimed_by: leased.then(|| self.owner.clone()),
            lease_until: leased.then(|| self.lease_deadline(now)),
        }
    }

    /// A pending task suspends until its deadline, then resolves with `null`.
    async fn settle_pending(&self, task: Task, now: DateTime<Utc>) -> Result<TaskResult> {
        match task.delay_until {
            Some(at) if at <= now => {
                let task = self.resolve(task, serde_json::Value::Null, now).await?;
                Ok(TaskResult::Completed {
                    task,
                    cached: false,
                })
            }
            resume_at => Ok(TaskResult::Suspended { task, resume_at }),
        }
    }

    /// Run the side effect for a task this ledger holds the lease on.
    async fn invoke<F, Fut>(&self, mut task: Task, side_effect: F) -> Result<TaskResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<serde_json::Value, TaskFailure>>,
    {
        let started = Instant::now();
        let outcome = self.hold_lease(&task, side_effect()).await;
        metrics::task_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("task", task.name.clone())],
        );

        match outcome {
            Ok(output) => {
                task.status = TaskStatus::Completed;
                task.output = Some(output);
                task.completed_at = Some(Utc::now());
                task.release_lease();
                self.store.update_task(&task).await?;
                debug!(task_id = %task.id, "task completed");
                Ok(TaskResult::Completed {
                    task,
                    cached: false,
                })
            }
            Err(failure) => {
                warn!(task_id = %task.id, error = %failure.message, "task errored");
                task.status = TaskStatus::Errored;
                task.error = Some(failure);
                task.release_lease();
                self.store.update_task(&task).await?;
                Ok(TaskResult::Errored(task))
            }
        }
    }

    /// Drive `effect` to completion, renewing the lease on `task` every
    /// third of the lease period.
    async fn hold_lease<Fut: Future>(&self, task: &Task, effect: Fut) -> Fut::Output {
        let period = (self.lease / 3).max(Duration::from_millis(10));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        tokio::pin!(effect);
        loop {
            tokio::select! {
                outcome = &mut effect => return outcome,
                _ = heartbeat.tick() => {
                    let lease_until = self.lease_deadline(Utc::now());
                    match self.store.renew_task_lease(&task.id, &self.owner, lease_until).await {
                        Ok(true) => {}
                        Ok(false) => warn!(task_id = %task.id, "task lease lost while running"),
                        Err(e) => warn!(task_id = %task.id, error = %e, "task lease renewal failed"),
                    }
                }
            }
        }
    }

    async fn resolve(
        &self,
        mut task: Task,
        output: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        task.status = TaskStatus::Completed;
        task.output = Some(output);
        task.completed_at = Some(now);
        task.release_lease();
        self.store.update_task(&task).await?;
        Ok(task)
    }

    async fn ensure_live(&self, execution_id: &ExecutionId) -> Result<()> {
        let execution = self.store.get_execution(execution_id).await?;
        if execution.state.is_terminal() {
            return Err(Error::ExecutionFinished(execution_id.to_string()));
        }
        Ok(())
    }

    /// Record a task that an external callback will complete, and suspend on
    /// it. Replays like any other task once completed.
    pub async fn begin_deferred(
        &self,
        execution_id: &ExecutionId,
        request: RunTaskBodyOutput,
    ) -> Result<TaskResult> {
        self.ensure_live(execution_id).await?;
        let now = Utc::now();

        let mut request = request;
        request.delay_until = None;
        request.noop = false;

        let task = self.new_task(execution_id, &request, TaskStatus::Pending, now);
        let task = self.store.insert_task(&task).await?.into_inner();
        ensure_same_params(execution_id, &task, &request)?;

        match task.status {
            TaskStatus::Completed => Ok(TaskResult::Completed { task, cached: true }),
            TaskStatus::Errored => Ok(TaskResult::Errored(task)),
            _ => Ok(TaskResult::Suspended {
                task,
                resume_at: None,
            }),
        }
    }

    /// Complete a pending or running task from outside the worker.
    ///
    /// Completing an already completed task returns it unchanged.
    pub async fn complete_task(
        &self,
        execution_id: &ExecutionId,
        task_id: &TaskId,
        body: CompleteTaskBodyInput,
    ) -> Result<Task> {
        let mut task = self.store.get_task(task_id).await?;
        if task.execution_id != *execution_id {
            return Err(Error::NotFound(format!(
                "task {task_id} in execution {execution_id}"
            )));
        }
        if task.status == TaskStatus::Completed {
            return Ok(task);
        }
        if !task.status.can_transition_to(TaskStatus::Completed) {
            return Err(Error::InvalidTransition {
                from: task.status.to_string(),
                to: TaskStatus::Completed.to_string(),
            });
        }
        if let Some(params) = body.params.filter(|p| !p.is_null())
            && task.params.as_ref() != Some(&params)
        {
            return Err(Error::IdempotencyConflict {
                execution_id: execution_id.to_string(),
                key: task.idempotency_key,
            });
        }
        self.ensure_live(execution_id).await?;

        if body.elements.is_some() {
            task.elements = body.elements;
        }
        if body.description.is_some() {
            task.description = body.description;
        }
        let task = self.resolve(task, body.output, Utc::now()).await?;
        info!(task_id = %task.id, execution_id = %execution_id, "task completed externally");
        Ok(task)
    }

    /// Complete every pending delay task whose deadline has passed.
    pub async fn resolve_elapsed(
        &self,
        execution_id: &ExecutionId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>> {
        let mut resolved = Vec::new();
        for task in self.store.list_tasks(execution_id).await? {
            if task.status == TaskStatus::Pending
                && let Some(at) = task.delay_until
                && at <= now
            {
                resolved.push(self.resolve(task, serde_json::Value::Null, now).await?);
            }
        }
        Ok(resolved)
    }

    /// Completed tasks in creation order, up to the first that is not.
    pub async fn cached_prefix(&self, execution_id: &ExecutionId) -> Result<Vec<CachedTask>> {
        Ok(self
            .store
            .list_tasks(execution_id)
            .await?
            .iter()
            .take_while(|t| t.status == TaskStatus::Completed)
            .map(Task::to_cached)
            .collect())
    }

    pub async fn tasks(&self, execution_id: &ExecutionId) -> Result<Vec<Task>> {
        self.store.list_tasks(execution_id).await
    }
}

fn ensure_same_params(
    execution_id: &ExecutionId,
    task: &Task,
    request: &RunTaskBodyOutput,
) -> Result<()> {
    if task.params != request.params {
        return Err(Error::IdempotencyConflict {
            execution_id: execution_id.to_string(),
            key: request.idempotency_key.clone(),
        });
    }
    Ok(())
}
