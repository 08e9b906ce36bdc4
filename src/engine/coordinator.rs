//! Execution coordinator: owns the execution state machine.
//!
//! ```text
//! CREATED -> RUNNING -> COMPLETED
//!    |         |  ^ \-> FAILED
//!    |         v  |
//!    |       SUSPENDED -> FAILED
//!    \-> FAILED
//! ```
//!
//! Every transition goes through the store with the expected `from` state,
//! so two coordinators racing on one execution cannot both apply a change.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::ledger::TaskLedger;
use crate::model::{
    ConnectionAuth, Execution, ExecutionContext, ExecutionError, ExecutionId, ExecutionPatch,
    ExecutionState, IdGenerator, Job, JobRef, RawEvent, Task, TaskId, TaskStatus,
};
use crate::registry::JobRegistry;
use crate::resolver::ConnectionResolver;
use crate::store::Store;
use crate::telemetry::execution::{record_state_transition, start_execution_span};
use crate::telemetry::metrics;
use crate::wire::validate::{validate_complete_task, validate_execute_response};
use crate::wire::{
    CompleteTaskBodyInput, ExecuteJobBody, ExecuteJobResponse, PrepareForJobExecutionBody,
    PrepareForJobExecutionResponse,
};
use crate::worker::Worker;

pub struct Coordinator {
    store: Arc<dyn Store>,
    registry: Arc<JobRegistry>,
    resolver: Arc<dyn ConnectionResolver>,
    ledger: Arc<TaskLedger>,
    worker: Arc<dyn Worker>,
    ids: Arc<dyn IdGenerator>,
    config: EngineConfig,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<JobRegistry>,
        resolver: Arc<dyn ConnectionResolver>,
        ledger: Arc<TaskLedger>,
        worker: Arc<dyn Worker>,
        ids: Arc<dyn IdGenerator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            resolver,
            ledger,
            worker,
            ids,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn get(&self, id: &ExecutionId) -> Result<Execution> {
        self.store.get_execution(id).await
    }

    pub async fn tasks(&self, id: &ExecutionId) -> Result<Vec<Task>> {
        self.ledger.tasks(id).await
    }

    /// Create the execution of `job` for `event` and move it to RUNNING.
    ///
    /// Idempotent per (job version, event): a repeated call returns the
    /// execution created by the first. If connection auth cannot be
    /// resolved the execution is persisted as FAILED and
    /// [`Error::AuthResolution`] is returned.
    pub async fn create_execution(
        &self,
        job: &Job,
        event: &RawEvent,
        is_test: bool,
    ) -> Result<Execution> {
        let job_ref = job.job_ref();
        if !job.trigger.matches(event) {
            return Err(Error::Validation(format!(
                "event {} ({}) does not trigger job {job_ref}",
                event.id, event.name
            )));
        }
        if self.registry.is_deprecated(&job_ref)? {
            return Err(Error::Validation(format!(
                "job {job_ref} is deprecated"
            )));
        }

        let now = Utc::now();
        let id = ExecutionId(self.ids.next());
        let execution = Execution {
            id: id.clone(),
            job: job_ref.clone(),
            event: event.clone(),
            context: ExecutionContext {
                id: id.clone(),
                environment: self.config.environment.clone(),
                organization: self.config.organization.clone(),
                is_test,
                version: job.version.clone(),
                started_at: now,
            },
            connections: HashMap::new(),
            state: ExecutionState::Created,
            attempts: 0,
            retry_at: None,
            resume_at: None,
            suspended_at: None,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };

        let inserted = self.store.insert_execution(&execution).await?;
        if !inserted.is_new() {
            let existing = inserted.into_inner();
            debug!(execution_id = %existing.id, job = %job_ref, event_id = %event.id, "execution already exists");
            metrics::executions_created().add(
                1,
                &[
                    KeyValue::new("job", job_ref.to_string()),
                    KeyValue::new("result", "duplicate"),
                ],
            );
            return Ok(existing);
        }

        let span = start_execution_span(&id, &job_ref);
        let result = self.activate(inserted.into_inner(), job, &span).await;
        metrics::executions_created().add(
            1,
            &[
                KeyValue::new("job", job_ref.to_string()),
                KeyValue::new("result", if result.is_ok() { "new" } else { "auth_failed" }),
            ],
        );
        result
    }

    /// Resolve connections and move a CREATED execution to RUNNING, or to
    /// FAILED when resolution fails.
    async fn activate(&self, execution: Execution, job: &Job, span: &Span) -> Result<Execution> {
        match self.resolve(job).await {
            Ok(connections) => {
                let mut execution = self
                    .transition(
                        span,
                        &execution.id,
                        ExecutionState::Created,
                        ExecutionState::Running,
                        ExecutionPatch::default(),
                    )
                    .await?;
                execution.connections = connections;
                info!(execution_id = %execution.id, job = %execution.job, "execution created");
                Ok(execution)
            }
            Err(err) => {
                warn!(execution_id = %execution.id, job = %execution.job, error = %err, "connection auth resolution failed");
                self.transition(
                    span,
                    &execution.id,
                    ExecutionState::Created,
                    ExecutionState::Failed,
                    ExecutionPatch {
                        error: Some(ExecutionError::from(&err)),
                        ..Default::default()
                    },
                )
                .await?;
                Err(err)
            }
        }
    }

    async fn resolve(&self, job: &Job) -> Result<HashMap<String, ConnectionAuth>> {
        self.resolver
            .resolve(&job.connections, &self.config.environment)
            .await
            .map_err(|source| Error::AuthResolution {
                connection: failed_connection(&source),
                source: Box::new(source),
            })
    }

    async fn transition(
        &self,
        span: &Span,
        id: &ExecutionId,
        from: ExecutionState,
        to: ExecutionState,
        patch: ExecutionPatch,
    ) -> Result<Execution> {
        let execution = self
            .store
            .transition_execution(id, from, to, patch)
            .await?;
        record_state_transition(span, from, to);
        Ok(execution)
    }

    fn job_for(&self, job: &JobRef) -> Result<Job> {
        self.registry
            .get(job)?
            .ok_or_else(|| Error::NotFound(format!("job {job}")))
    }

    /// Hand a RUNNING execution to the worker and apply its answer.
    ///
    /// Suspended or finished executions, and those waiting out a retry
    /// delay, are returned unchanged.
    pub async fn dispatch(&self, id: &ExecutionId) -> Result<Execution> {
        self.dispatch_at(id, Utc::now()).await
    }

    /// Dispatch as of `now`: retry delays and elapsed task delays are judged
    /// against it.
    async fn dispatch_at(&self, id: &ExecutionId, now: DateTime<Utc>) -> Result<Execution> {
        let execution = self.store.get_execution(id).await?;
        let span = start_execution_span(id, &execution.job);
        self.dispatch_execution(execution, now, span.clone())
            .instrument(span)
            .await
    }

    async fn dispatch_execution(
        &self,
        execution: Execution,
        now: DateTime<Utc>,
        span: Span,
    ) -> Result<Execution> {
        let job = self.job_for(&execution.job)?;

        let execution = match execution.state {
            ExecutionState::Created => self.activate(execution, &job, &span).await?,
            ExecutionState::Running => execution,
            state => {
                debug!(execution_id = %execution.id, %state, "nothing to dispatch");
                return Ok(execution);
            }
        };
        if let Some(retry_at) = execution.retry_at
            && retry_at > now
        {
            debug!(execution_id = %execution.id, %retry_at, "retry not yet due");
            return Ok(execution);
        }

        let id = execution.id.clone();
        let mut redispatched = false;
        loop {
            let connections = match self.resolve(&job).await {
                Ok(connections) => connections,
                Err(err) => return self.report_failure(&id, err).await,
            };

            let resolved = self.ledger.resolve_elapsed(&id, now).await?;
            if !resolved.is_empty() {
                debug!(execution_id = %id, count = resolved.len(), "elapsed delays resolved");
            }
            let tasks = self.ledger.cached_prefix(&id).await?;
            info!(execution_id = %id, cached = tasks.len(), attempt = execution.attempts + 1, "dispatching");

            let body = ExecuteJobBody {
                event: execution.event.clone(),
                job: execution.job.clone(),
                context: execution.context.clone(),
                tasks,
                connections,
            };

            let response = match self.worker.execute(body).await {
                Ok(response) => response,
                Err(err) => return self.report_failure(&id, err).await,
            };
            if let Err(err) = validate_execute_response(&response) {
                return self.report_failure(&id, err).await;
            }
            if response.execution_id != id {
                let err = Error::Validation(format!(
                    "worker answered for execution {} while dispatching {id}",
                    response.execution_id
                ));
                return self.report_failure(&id, err).await;
            }

            match self.apply_response(&id, response).await? {
                Applied::Settled(execution) => return Ok(execution),
                Applied::Redispatch(task) if !redispatched => {
                    debug!(execution_id = %id, task = %task.idempotency_key, "waited-on task already completed, dispatching again");
                    redispatched = true;
                }
                Applied::Redispatch(task) => {
                    let err = Error::Validation(format!(
                        "worker suspended twice on completed task {}",
                        task.idempotency_key
                    ));
                    return self.report_failure(&id, err).await;
                }
            }
        }
    }

    /// Apply a worker's answer.
    ///
    /// Completed runs finish the execution. An interrupted run either
    /// suspends on its waiting task or, when the task errored, is handed to
    /// [`Coordinator::report_failure`].
    ///
    /// A run that suspended on a task which has meanwhile been completed is
    /// dispatched again instead of suspending.
    pub async fn report_completion(
        &self,
        id: &ExecutionId,
        response: ExecuteJobResponse,
    ) -> Result<Execution> {
        validate_execute_response(&response)?;
        match self.apply_response(id, response).await? {
            Applied::Settled(execution) => Ok(execution),
            Applied::Redispatch(_) => self.dispatch(id).await,
        }
    }

    async fn apply_response(
        &self,
        id: &ExecutionId,
        response: ExecuteJobResponse,
    ) -> Result<Applied> {
        let execution = self.store.get_execution(id).await?;
        if execution.state.is_terminal() {
            debug!(execution_id = %id, state = %execution.state, "ignoring completion for finished execution");
            return Ok(Applied::Settled(execution));
        }
        let span = start_execution_span(id, &execution.job);

        if response.completed {
            let execution = self
                .transition(
                    &span,
                    id,
                    execution.state,
                    ExecutionState::Completed,
                    ExecutionPatch {
                        retry_at: Some(None),
                        output: Some(response.output.unwrap_or(serde_json::Value::Null)),
                        ..Default::default()
                    },
                )
                .await?;
            info!(execution_id = %id, "execution completed");
            return Ok(Applied::Settled(execution));
        }

        let reported = response
            .task
            .ok_or_else(|| Error::Validation("interrupted response without task".to_string()))?;
        let task = self.record_task(reported).await?;

        match task.status {
            TaskStatus::Completed => return Ok(Applied::Redispatch(task)),
            TaskStatus::Errored => {
                let message = task
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "task errored".to_string());
                let err = Error::TaskExecution {
                    key: task.idempotency_key,
                    message,
                };
                return self.report_failure(id, err).await.map(Applied::Settled);
            }
            TaskStatus::Pending | TaskStatus::Running => {}
        }

        let now = Utc::now();
        let execution = self
            .transition(
                &span,
                id,
                execution.state,
                ExecutionState::Suspended,
                ExecutionPatch {
                    retry_at: Some(None),
                    resume_at: Some(task.delay_until),
                    suspended_at: Some(Some(now)),
                    ..Default::default()
                },
            )
            .await?;
        info!(
            execution_id = %id,
            task = %task.idempotency_key,
            resume_at = ?task.delay_until,
            "execution suspended"
        );
        Ok(Applied::Settled(execution))
    }

    /// Persist a task reported by the worker, keeping the ledger's record
    /// when the worker's copy is no further along.
    async fn record_task(&self, reported: Task) -> Result<Task> {
        let inserted = self.store.insert_task(&reported).await?;
        if inserted.is_new() {
            return Ok(reported);
        }
        let stored = inserted.into_inner();
        if stored.status.progress() >= reported.status.progress() {
            if stored.status != reported.status {
                debug!(
                    task_id = %stored.id,
                    stored = %stored.status,
                    reported = %reported.status,
                    "worker reported a stale task, keeping the ledger's record"
                );
            }
            return Ok(stored);
        }
        let mut task = stored;
        task.status = reported.status;
        task.output = reported.output;
        task.error = reported.error;
        task.attempts = task.attempts.max(reported.attempts);
        self.store.update_task(&task).await?;
        Ok(task)
    }

    /// Apply a failed attempt: retry with backoff when the error kind is
    /// retryable and attempts remain, otherwise fail the execution.
    pub async fn report_failure(&self, id: &ExecutionId, err: Error) -> Result<Execution> {
        let execution = self.store.get_execution(id).await?;
        if execution.state.is_terminal() {
            debug!(execution_id = %id, error = %err, "ignoring failure for finished execution");
            return Ok(execution);
        }

        let span = start_execution_span(id, &execution.job);
        let now = Utc::now();
        let attempts = execution.attempts + 1;
        let policy = &self.config.execution_retry;

        if err.is_retryable()
            && execution.state == ExecutionState::Running
            && policy.should_retry(attempts)
        {
            let retry_at = policy.next_at(attempts, now);
            warn!(execution_id = %id, attempts, %retry_at, error = %err, "execution attempt failed, retrying");
            return self
                .store
                .patch_execution(
                    id,
                    ExecutionState::Running,
                    ExecutionPatch {
                        attempts: Some(attempts),
                        retry_at: Some(Some(retry_at)),
                        error: Some(ExecutionError::from(&err)),
                        ..Default::default()
                    },
                )
                .await;
        }

        error!(execution_id = %id, attempts, kind = %err.kind(), error = %err, "execution failed");
        self.transition(
            &span,
            id,
            execution.state,
            ExecutionState::Failed,
            ExecutionPatch {
                attempts: Some(attempts),
                retry_at: Some(None),
                error: Some(ExecutionError::from(&err)),
                ..Default::default()
            },
        )
        .await
    }

    /// Resolve every connection of a job ahead of its first execution.
    pub async fn prepare(
        &self,
        body: &PrepareForJobExecutionBody,
    ) -> Result<PrepareForJobExecutionResponse> {
        let job = self.job_for(&body.job_ref())?;
        if !job.supports_preparation {
            return Ok(PrepareForJobExecutionResponse { ok: false });
        }
        self.resolve(&job).await?;
        info!(job = %job.job_ref(), "job prepared");
        Ok(PrepareForJobExecutionResponse { ok: true })
    }

    /// Fail a non-terminal execution. Completed tasks are kept.
    pub async fn abort(&self, id: &ExecutionId, reason: &str) -> Result<Execution> {
        let error = ExecutionError::new(ErrorKind::Aborted, reason);
        let execution = self.fail_with(id, error).await?;
        info!(execution_id = %id, reason, "execution aborted");
        Ok(execution)
    }

    /// Move any non-terminal execution to FAILED, re-reading on races.
    pub(crate) async fn fail_with(&self, id: &ExecutionId, error: ExecutionError) -> Result<Execution> {
        loop {
            let execution = self.store.get_execution(id).await?;
            if execution.state.is_terminal() {
                return Err(Error::InvalidTransition {
                    from: execution.state.to_string(),
                    to: ExecutionState::Failed.to_string(),
                });
            }
            let span = start_execution_span(id, &execution.job);
            let patch = ExecutionPatch {
                retry_at: Some(None),
                resume_at: Some(None),
                error: Some(error.clone()),
                ..Default::default()
            };
            match self
                .transition(&span, id, execution.state, ExecutionState::Failed, patch)
                .await
            {
                Err(Error::InvalidTransition { .. }) => continue,
                result => return result,
            }
        }
    }

    /// Deprecate a job version and abort its unfinished executions.
    pub async fn deprecate_job_version(
        &self,
        job_id: &str,
        version: &str,
    ) -> Result<Vec<ExecutionId>> {
        let job = JobRef {
            id: job_id.to_string(),
            version: version.to_string(),
        };
        self.registry.deprecate(&job)?;

        let mut aborted = Vec::new();
        for execution in self.store.list_executions_for_job(&job).await? {
            if execution.state.is_terminal() {
                continue;
            }
            match self.abort(&execution.id, "job version deprecated").await {
                Ok(_) => aborted.push(execution.id),
                // Finished while we were iterating.
                Err(Error::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(aborted)
    }

    /// External completion of a deferred task. Resumes the execution if it
    /// was suspended.
    pub async fn complete_task(
        &self,
        execution_id: &ExecutionId,
        task_id: &TaskId,
        body: CompleteTaskBodyInput,
    ) -> Result<Execution> {
        validate_complete_task(&body)?;
        self.ledger.complete_task(execution_id, task_id, body).await?;

        let execution = self.store.get_execution(execution_id).await?;
        if execution.state != ExecutionState::Suspended {
            return Ok(execution);
        }
        self.resume(execution_id).await
    }

    /// SUSPENDED -> RUNNING, then dispatch.
    pub async fn resume(&self, id: &ExecutionId) -> Result<Execution> {
        self.resume_as_of(id, Utc::now()).await
    }

    async fn resume_as_of(&self, id: &ExecutionId, now: DateTime<Utc>) -> Result<Execution> {
        let execution = self.store.get_execution(id).await?;
        let span = start_execution_span(id, &execution.job);
        self.transition(
            &span,
            id,
            ExecutionState::Suspended,
            ExecutionState::Running,
            ExecutionPatch {
                resume_at: Some(None),
                suspended_at: Some(None),
                ..Default::default()
            },
        )
        .await?;
        info!(execution_id = %id, "execution resumed");
        self.dispatch_at(id, now).await
    }

    /// Re-dispatch suspended executions whose deadline passed and running
    /// executions whose retry is due.
    pub async fn resume_due(&self, now: DateTime<Utc>) -> Result<Vec<Execution>> {
        let mut dispatched = Vec::new();

        for execution in self.store.list_executions(ExecutionState::Suspended).await? {
            if execution.resume_at.is_none_or(|at| at > now) {
                continue;
            }
            match self.resume_as_of(&execution.id, now).await {
                Ok(e) => dispatched.push(e),
                Err(Error::InvalidTransition { .. }) => {
                    debug!(execution_id = %execution.id, "resumed elsewhere");
                }
                Err(e) => warn!(execution_id = %execution.id, error = %e, "resume failed"),
            }
        }

        for execution in self.store.list_executions(ExecutionState::Running).await? {
            if execution.retry_at.is_none_or(|at| at > now) {
                continue;
            }
            let cleared = self
                .store
                .patch_execution(
                    &execution.id,
                    ExecutionState::Running,
                    ExecutionPatch {
                        retry_at: Some(None),
                        ..Default::default()
                    },
                )
                .await;
            if let Err(e) = cleared {
                debug!(execution_id = %execution.id, error = %e, "retry picked up elsewhere");
                continue;
            }
            match self.dispatch_at(&execution.id, now).await {
                Ok(e) => dispatched.push(e),
                Err(e) => warn!(execution_id = %execution.id, error = %e, "retry dispatch failed"),
            }
        }

        Ok(dispatched)
    }

    /// Fail executions that have been suspended longer than the configured
    /// maximum.
    pub async fn abandon_stale(&self, now: DateTime<Utc>) -> Result<Vec<ExecutionId>> {
        let max = chrono::Duration::from_std(self.config.max_suspension)
            .map_err(|e| Error::Config(format!("max suspension out of range: {e}")))?;

        let mut abandoned = Vec::new();
        for execution in self.store.list_executions(ExecutionState::Suspended).await? {
            let Some(suspended_at) = execution.suspended_at else {
                continue;
            };
            if suspended_at + max > now {
                continue;
            }
            let error = ExecutionError::new(
                ErrorKind::Aborted,
                format!("suspended since {suspended_at}, longer than allowed"),
            );
            match self.fail_with(&execution.id, error).await {
                Ok(_) => {
                    warn!(execution_id = %execution.id, %suspended_at, "suspended execution abandoned");
                    abandoned.push(execution.id);
                }
                Err(Error::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(abandoned)
    }
}

/// What applying a worker's answer left to do.
enum Applied {
    Settled(Execution),
    /// The run stopped on a task that is already completed.
    Redispatch(Task),
}

/// Connection key named by a resolver error.
fn failed_connection(err: &Error) -> String {
    match err {
        Error::ConnectionNotFound(key) => key.clone(),
        Error::AuthExpired { key, .. } => key.clone(),
        Error::AuthResolution { connection, .. } => connection.clone(),
        _ => "*".to_string(),
    }
}
