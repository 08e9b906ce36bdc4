//! Worker side of a dispatch: run job code and replay completed tasks.
//!
//! A dispatch hands the worker the completed-task prefix of the execution.
//! [`JobIo`] serves task calls from that prefix first and only goes to the
//! ledger once it is exhausted, so job code written top to bottom resumes
//! where the previous attempt stopped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::ledger::{TaskLedger, TaskResult};
use crate::model::{
    CachedTask, ConnectionAuth, ExecutionContext, ExecutionId, RawEvent, Task, TaskFailure,
};
use crate::wire::validate::validate_run_task;
use crate::wire::{ExecuteJobBody, ExecuteJobResponse, RunTaskBodyInput, RunTaskBodyOutput};

/// Runs one dispatch of an execution.
///
/// `Err` means the dispatch itself failed (worker unreachable, job code
/// crashed); task failures come back inside the response.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn execute(&self, body: ExecuteJobBody) -> Result<ExecuteJobResponse>;
}

/// Why job code stopped before returning an output.
#[derive(Debug)]
pub enum Interrupt {
    /// A task is waiting on a deadline or an external completion.
    Suspend(Task),
    /// A task's side effect failed.
    TaskFailed(Task),
    Error(Error),
}

impl From<Error> for Interrupt {
    fn from(err: Error) -> Self {
        Interrupt::Error(err)
    }
}

/// User job code.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, io: &mut JobIo<'_>) -> std::result::Result<serde_json::Value, Interrupt>;
}

/// Job code's view of its execution.
pub struct JobIo<'a> {
    ledger: &'a TaskLedger,
    execution_id: ExecutionId,
    event: RawEvent,
    context: ExecutionContext,
    connections: HashMap<String, ConnectionAuth>,
    cached: VecDeque<CachedTask>,
    replayed: usize,
}

impl<'a> JobIo<'a> {
    pub fn new(ledger: &'a TaskLedger, body: ExecuteJobBody) -> Self {
        Self {
            ledger,
            execution_id: body.context.id.clone(),
            event: body.event,
            context: body.context,
            connections: body.connections,
            cached: body.tasks.into(),
            replayed: 0,
        }
    }

    pub fn event(&self) -> &RawEvent {
        &self.event
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn connection(&self, key: &str) -> Option<&ConnectionAuth> {
        self.connections.get(key)
    }

    /// Tasks served from the cached prefix so far.
    pub fn replayed(&self) -> usize {
        self.replayed
    }

    /// Pop the head of the cached prefix if it belongs to the requested key.
    /// The head's params must match the request's.
    fn replay(&mut self, request: &RunTaskBodyOutput) -> Result<Option<serde_json::Value>> {
        let key = request.idempotency_key.as_str();
        if self
            .cached
            .front()
            .is_none_or(|head| head.idempotency_key != key)
        {
            return Ok(None);
        }
        let Some(cached) = self.cached.pop_front() else {
            return Ok(None);
        };
        if cached.params != request.params {
            return Err(Error::IdempotencyConflict {
                execution_id: self.execution_id.to_string(),
                key: key.to_string(),
            });
        }
        self.replayed += 1;
        debug!(key, task_id = %cached.id, "replayed cached task");
        Ok(Some(cached.output.unwrap_or(serde_json::Value::Null)))
    }

    /// Run a task, or return its recorded output on replay.
    pub async fn run_task<F, Fut>(
        &mut self,
        input: RunTaskBodyInput,
        side_effect: F,
    ) -> std::result::Result<serde_json::Value, Interrupt>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<serde_json::Value, TaskFailure>>,
    {
        let request = validate_run_task(input)?;
        if let Some(output) = self.replay(&request)? {
            return Ok(output);
        }
        let result = self
            .ledger
            .run_task(&self.execution_id, request, side_effect)
            .await?;
        settle(result)
    }

    /// Suspend the execution until `at`.
    pub async fn wait_until(
        &mut self,
        key: impl Into<String>,
        at: DateTime<Utc>,
    ) -> std::result::Result<(), Interrupt> {
        let input = RunTaskBodyInput::new(key, "wait").delay_until(at);
        self.run_task(input, || async { Ok(serde_json::Value::Null) })
            .await
            .map(|_| ())
    }

    /// Record a checkpoint with no side effect.
    pub async fn checkpoint(
        &mut self,
        key: impl Into<String>,
        name: impl Into<String>,
    ) -> std::result::Result<(), Interrupt> {
        let input = RunTaskBodyInput::new(key, name).noop();
        self.run_task(input, || async { Ok(serde_json::Value::Null) })
            .await
            .map(|_| ())
    }

    /// Suspend until the task is completed from outside, then return the
    /// output it was completed with.
    pub async fn wait_for_callback(
        &mut self,
        input: RunTaskBodyInput,
    ) -> std::result::Result<serde_json::Value, Interrupt> {
        let request = validate_run_task(input)?;
        if let Some(output) = self.replay(&request)? {
            return Ok(output);
        }
        let result = self
            .ledger
            .begin_deferred(&self.execution_id, request)
            .await?;
        settle(result)
    }
}

fn settle(result: TaskResult) -> std::result::Result<serde_json::Value, Interrupt> {
    match result {
        TaskResult::Completed { task, .. } => {
            Ok(task.output.unwrap_or(serde_json::Value::Null))
        }
        TaskResult::Errored(task) => Err(Interrupt::TaskFailed(task)),
        TaskResult::Suspended { task, .. } => Err(Interrupt::Suspend(task)),
    }
}

/// In-process worker running registered handlers against the ledger.
pub struct LocalWorker {
    ledger: Arc<TaskLedger>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl LocalWorker {
    pub fn new(ledger: Arc<TaskLedger>) -> Self {
        Self {
            ledger,
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for every version of `job_id`.
    pub fn with_handler(mut self, job_id: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job_id.into(), handler);
        self
    }
}

#[async_trait]
impl Worker for LocalWorker {
    async fn execute(&self, body: ExecuteJobBody) -> Result<ExecuteJobResponse> {
        let handler = self
            .handlers
            .get(&body.job.id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("handler for job {}", body.job)))?;

        let execution_id = body.context.id.clone();
        let cached = body.tasks.len();
        let mut io = JobIo::new(&self.ledger, body);

        let outcome = handler.run(&mut io).await;
        info!(
            execution_id = %execution_id,
            cached,
            replayed = io.replayed(),
            "job code returned"
        );

        match outcome {
            Ok(output) => Ok(ExecuteJobResponse::completed(execution_id, output)),
            Err(Interrupt::Suspend(task)) | Err(Interrupt::TaskFailed(task)) => {
                Ok(ExecuteJobResponse::interrupted(execution_id, task))
            }
            Err(Interrupt::Error(e)) => Err(e),
        }
    }
}
