//! End-to-end engine scenarios against the in-memory store: events in,
//! executions dispatched to in-process handlers, tasks replayed.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jobrun_rs::config::EngineConfig;
use jobrun_rs::engine::{Coordinator, Engine, EngineBuilder, Tick};
use jobrun_rs::error::{Error, ErrorKind};
use jobrun_rs::model::{
    ConnectionAuth, ConnectionMetadata, Credential, EventId, EventTrigger, Execution,
    ExecutionState, Job, JobConnection, JobRef, SequentialIdGenerator, TaskFailure, TaskStatus,
};
use jobrun_rs::registry::JobRegistry;
use jobrun_rs::resolver::InMemoryCredentials;
use jobrun_rs::store::Store;
use jobrun_rs::wire::{
    CompleteTaskBodyInput, ExecuteJobResponse, PrepareForJobExecutionBody, RawEventInput,
    RunTaskBodyInput, SendEventBody, SendEventOptions,
};
use jobrun_rs::worker::{Interrupt, JobHandler, JobIo};
use secrecy::SecretString;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn job(id: &str, event: &str) -> Job {
    Job {
        id: id.into(),
        name: format!("{id} job"),
        version: "1".into(),
        trigger: EventTrigger {
            event: event.into(),
            source: None,
            filter: None,
        },
        connections: vec![],
        supports_preparation: false,
    }
}

fn builder(jobs: Vec<Job>) -> EngineBuilder {
    let registry = JobRegistry::empty();
    for job in jobs {
        registry.register(job).unwrap();
    }
    Engine::builder(EngineConfig::new("app"))
        .registry(Arc::new(registry))
        .ids(Arc::new(SequentialIdGenerator::new("x")))
}

fn event(name: &str, id: &str, payload: Value) -> SendEventBody {
    SendEventBody {
        event: RawEventInput::new(name, payload).id(id),
        options: SendEventOptions::default(),
    }
}

async fn executions_of(engine: &Engine, job_id: &str) -> Vec<Execution> {
    engine
        .store()
        .list_executions_for_job(&JobRef {
            id: job_id.into(),
            version: "1".into(),
        })
        .await
        .unwrap()
}

async fn only_execution(engine: &Engine, job_id: &str) -> Execution {
    let mut executions = executions_of(engine, job_id).await;
    assert_eq!(executions.len(), 1, "expected exactly one execution");
    executions.remove(0)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Sends a welcome email, then loses its worker once before finishing.
#[derive(Default)]
struct Welcome {
    sends: AtomicUsize,
    runs: AtomicUsize,
}

#[async_trait]
impl JobHandler for Welcome {
    async fn run(&self, io: &mut JobIo<'_>) -> Result<Value, Interrupt> {
        let user = io.event().payload["id"].clone();
        io.run_task(
            RunTaskBodyInput::new("send-welcome-email", "Send welcome email")
                .params(json!({"to": user})),
            || async {
                self.sends.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"messageId": "m-1"}))
            },
        )
        .await?;

        if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(Interrupt::Error(Error::Delivery(
                "worker connection lost".into(),
            )));
        }

        io.checkpoint("welcomed", "Mark user welcomed").await?;
        Ok(json!({"welcomed": user}))
    }
}

/// One task, then done.
#[derive(Default)]
struct Greeter {
    runs: AtomicUsize,
}

#[async_trait]
impl JobHandler for Greeter {
    async fn run(&self, io: &mut JobIo<'_>) -> Result<Value, Interrupt> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let payload = io.event().payload.clone();
        io.run_task(
            RunTaskBodyInput::new("greet", "Greet").params(payload.clone()),
            || async { Ok(json!("hello")) },
        )
        .await?;
        Ok(payload)
    }
}

/// Collects, cools off for an hour after the event, then sends.
#[derive(Default)]
struct Digest {
    collects: AtomicUsize,
}

#[async_trait]
impl JobHandler for Digest {
    async fn run(&self, io: &mut JobIo<'_>) -> Result<Value, Interrupt> {
        let cool_off_until = io.event().timestamp + Duration::hours(1);
        let items = io
            .run_task(RunTaskBodyInput::new("collect", "Collect activity"), || async {
                self.collects.fetch_add(1, Ordering::SeqCst);
                Ok(json!(3))
            })
            .await?;
        io.wait_until("cool-off", cool_off_until).await?;
        io.run_task(
            RunTaskBodyInput::new("send-digest", "Send digest").params(json!({"items": items})),
            || async { Ok(json!("sent")) },
        )
        .await?;
        Ok(json!({"items": items}))
    }
}

/// Waits for an operator decision.
struct Approval;

#[async_trait]
impl JobHandler for Approval {
    async fn run(&self, io: &mut JobIo<'_>) -> Result<Value, Interrupt> {
        let decision = io
            .wait_for_callback(RunTaskBodyInput::new("approval", "Wait for approval"))
            .await?;
        Ok(json!({"decision": decision}))
    }
}

/// Waits for approval, but the approval lands while the run is still
/// reporting its suspension.
#[derive(Default)]
struct RacedApproval {
    coordinator: OnceLock<Arc<Coordinator>>,
    runs: AtomicUsize,
}

#[async_trait]
impl JobHandler for RacedApproval {
    async fn run(&self, io: &mut JobIo<'_>) -> Result<Value, Interrupt> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match io
            .wait_for_callback(RunTaskBodyInput::new("approval", "Wait for approval"))
            .await
        {
            Ok(decision) => Ok(json!({"decision": decision})),
            Err(Interrupt::Suspend(task)) => {
                let coordinator = self.coordinator.get().expect("coordinator set");
                let execution_id = io.context().id.clone();
                coordinator
                    .complete_task(
                        &execution_id,
                        &task.id,
                        CompleteTaskBodyInput {
                            output: json!("approved"),
                            ..Default::default()
                        },
                    )
                    .await?;
                Err(Interrupt::Suspend(task))
            }
            Err(other) => Err(other),
        }
    }
}

/// Charges an amount, asks for a receipt, then charges again on resume
/// with a different amount under the same key.
#[derive(Default)]
struct Recharge {
    runs: AtomicUsize,
}

#[async_trait]
impl JobHandler for Recharge {
    async fn run(&self, io: &mut JobIo<'_>) -> Result<Value, Interrupt> {
        let amount = 10 * (self.runs.fetch_add(1, Ordering::SeqCst) + 1);
        io.run_task(
            RunTaskBodyInput::new("charge", "Charge card").params(json!({"amount": amount})),
            || async { Ok(json!({"charged": amount})) },
        )
        .await?;
        let receipt = io
            .wait_for_callback(RunTaskBodyInput::new("receipt", "Wait for receipt"))
            .await?;
        Ok(receipt)
    }
}

/// Charges a card that declines the first `declines` attempts.
struct Charge {
    declines: usize,
    calls: AtomicUsize,
}

impl Charge {
    fn declining(declines: usize) -> Self {
        Self {
            declines,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl JobHandler for Charge {
    async fn run(&self, io: &mut JobIo<'_>) -> Result<Value, Interrupt> {
        io.run_task(
            RunTaskBodyInput::new("charge", "Charge card").params(json!({"amount": 10})),
            || async {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= self.declines {
                    Err(TaskFailure::new("card declined"))
                } else {
                    Ok(json!({"charged": 10}))
                }
            },
        )
        .await
    }
}

/// Reports whether the resend connection was handed over.
struct Mailer;

#[async_trait]
impl JobHandler for Mailer {
    async fn run(&self, io: &mut JobIo<'_>) -> Result<Value, Interrupt> {
        let has_key = matches!(io.connection("resend"), Some(ConnectionAuth::ApiKey { .. }));
        Ok(json!({"hasKey": has_key}))
    }
}

// ---------------------------------------------------------------------------
// Replay across a lost worker
// ---------------------------------------------------------------------------

#[tokio::test]
async fn welcome_email_is_sent_once_across_a_lost_worker() {
    let welcome = Arc::new(Welcome::default());
    let engine = builder(vec![job("J", "user.created")])
        .handler("J", welcome.clone())
        .build();

    let response = engine
        .router()
        .send(event("user.created", "e1", json!({"id": 42})))
        .await
        .unwrap();
    assert_eq!(response.id, EventId::from("e1"));
    assert!(response.delivered_at.is_some());

    let execution = only_execution(&engine, "J").await;
    assert_eq!(execution.state, ExecutionState::Running);
    assert_eq!(execution.attempts, 1);
    assert!(execution.retry_at.is_some());
    assert_eq!(execution.error.as_ref().unwrap().kind, ErrorKind::Delivery);

    let dispatched = engine
        .coordinator()
        .resume_due(Utc::now() + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].state, ExecutionState::Completed);
    assert_eq!(dispatched[0].output, Some(json!({"welcomed": 42})));
    assert_eq!(welcome.sends.load(Ordering::SeqCst), 1);

    let tasks = engine.coordinator().tasks(&execution.id).await.unwrap();
    let keys: Vec<_> = tasks.iter().map(|t| t.idempotency_key.as_str()).collect();
    assert_eq!(keys, ["send-welcome-email", "welcomed"]);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));
}

#[tokio::test]
async fn redelivered_event_runs_its_job_once() {
    let greeter = Arc::new(Greeter::default());
    let engine = builder(vec![job("G", "user.created")])
        .handler("G", greeter.clone())
        .build();

    engine
        .router()
        .send(event("user.created", "e1", json!({"id": 1})))
        .await
        .unwrap();
    let again = engine
        .router()
        .send(event("user.created", "e1", json!({"id": 2})))
        .await
        .unwrap();
    assert!(again.delivered_at.is_some());

    let log = engine.store().get_event(&EventId::from("e1")).await.unwrap();
    assert_eq!(log.event.payload, json!({"id": 1}), "original event kept");
    let redelivered = engine.router().deliver(&log.event).await.unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].state, ExecutionState::Completed);

    assert_eq!(greeter.runs.load(Ordering::SeqCst), 1);
    let execution = only_execution(&engine, "G").await;
    assert_eq!(execution.output, Some(json!({"id": 1})));
}

#[tokio::test]
async fn late_worker_answer_for_finished_execution_is_ignored() {
    let engine = builder(vec![job("G", "user.created")])
        .handler("G", Arc::new(Greeter::default()))
        .build();
    engine
        .router()
        .send(event("user.created", "e1", json!({"id": 1})))
        .await
        .unwrap();
    let execution = only_execution(&engine, "G").await;
    assert_eq!(execution.state, ExecutionState::Completed);

    let late = ExecuteJobResponse::completed(execution.id.clone(), json!("stale"));
    let unchanged = engine
        .coordinator()
        .report_completion(&execution.id, late)
        .await
        .unwrap();
    assert_eq!(unchanged.state, ExecutionState::Completed);
    assert_eq!(unchanged.output, Some(json!({"id": 1})));

    let malformed = ExecuteJobResponse {
        execution_id: execution.id.clone(),
        completed: false,
        output: None,
        task: None,
    };
    let err = engine
        .coordinator()
        .report_completion(&execution.id, malformed)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

// ---------------------------------------------------------------------------
// Suspension
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delayed_execution_resumes_once_the_delay_elapses() {
    let digest = Arc::new(Digest::default());
    let engine = builder(vec![job("D", "digest.requested")])
        .handler("D", digest.clone())
        .build();

    let sent_at = Utc::now();
    let mut body = event("digest.requested", "e1", json!({}));
    body.event.timestamp = Some(sent_at);
    engine.router().send(body).await.unwrap();

    let cool_off_until = sent_at + Duration::hours(1);
    let execution = only_execution(&engine, "D").await;
    assert_eq!(execution.state, ExecutionState::Suspended);
    assert_eq!(execution.resume_at, Some(cool_off_until));
    assert!(execution.suspended_at.is_some());

    let early = engine.coordinator().resume_due(Utc::now()).await.unwrap();
    assert!(early.is_empty());

    let dispatched = engine
        .coordinator()
        .resume_due(cool_off_until + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].state, ExecutionState::Completed);
    assert_eq!(dispatched[0].output, Some(json!({"items": 3})));
    assert_eq!(dispatched[0].resume_at, None);
    assert_eq!(digest.collects.load(Ordering::SeqCst), 1);

    let tasks = engine.coordinator().tasks(&execution.id).await.unwrap();
    assert_eq!(tasks.len(), 3);
    assert_eq!(tasks[1].idempotency_key, "cool-off");
    assert_eq!(tasks[1].output, Some(Value::Null));
}

#[tokio::test]
async fn callback_completion_resumes_the_execution() {
    let engine = builder(vec![job("A", "refund.requested")])
        .handler("A", Arc::new(Approval))
        .build();
    engine
        .router()
        .send(event("refund.requested", "e1", json!({"amount": 80})))
        .await
        .unwrap();

    let execution = only_execution(&engine, "A").await;
    assert_eq!(execution.state, ExecutionState::Suspended);
    assert_eq!(execution.resume_at, None);

    // Waiting on a callback never comes due by time alone.
    let dispatched = engine
        .coordinator()
        .resume_due(Utc::now() + Duration::days(1))
        .await
        .unwrap();
    assert!(dispatched.is_empty());

    let tasks = engine.coordinator().tasks(&execution.id).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Pending);

    let resumed = engine
        .coordinator()
        .complete_task(
            &execution.id,
            &tasks[0].id,
            CompleteTaskBodyInput {
                output: json!("approved"),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(resumed.state, ExecutionState::Completed);
    assert_eq!(resumed.output, Some(json!({"decision": "approved"})));
}

#[tokio::test]
async fn callback_landing_before_the_suspension_is_not_lost() {
    let handler = Arc::new(RacedApproval::default());
    let engine = builder(vec![job("A", "refund.requested")])
        .handler("A", handler.clone())
        .build();
    assert!(
        handler
            .coordinator
            .set(Arc::clone(engine.coordinator()))
            .is_ok()
    );

    engine
        .router()
        .send(event("refund.requested", "e1", json!({"amount": 80})))
        .await
        .unwrap();

    let execution = only_execution(&engine, "A").await;
    assert_eq!(execution.state, ExecutionState::Completed);
    assert_eq!(execution.output, Some(json!({"decision": "approved"})));
    assert_eq!(handler.runs.load(Ordering::SeqCst), 2);

    let tasks = engine.coordinator().tasks(&execution.id).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Completed);
    assert_eq!(tasks[0].output, Some(json!("approved")));
}

#[tokio::test]
async fn stale_suspension_is_abandoned() {
    let engine = builder(vec![job("A", "refund.requested")])
        .handler("A", Arc::new(Approval))
        .build();
    engine
        .router()
        .send(event("refund.requested", "e1", json!({})))
        .await
        .unwrap();
    let execution = only_execution(&engine, "A").await;

    let none = engine.coordinator().abandon_stale(Utc::now()).await.unwrap();
    assert!(none.is_empty());

    let abandoned = engine
        .coordinator()
        .abandon_stale(Utc::now() + Duration::days(8))
        .await
        .unwrap();
    assert_eq!(abandoned, vec![execution.id.clone()]);

    let execution = engine.coordinator().get(&execution.id).await.unwrap();
    assert_eq!(execution.state, ExecutionState::Failed);
    assert_eq!(execution.error.unwrap().kind, ErrorKind::Aborted);

    let tasks = engine.coordinator().tasks(&execution.id).await.unwrap();
    let err = engine
        .coordinator()
        .complete_task(&execution.id, &tasks[0].id, CompleteTaskBodyInput::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ExecutionFinished(_)));
}

// ---------------------------------------------------------------------------
// Failures and retries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn errored_task_is_retried_on_the_next_dispatch() {
    let charge = Arc::new(Charge::declining(1));
    let engine = builder(vec![job("C", "order.placed")])
        .handler("C", charge.clone())
        .build();
    engine
        .router()
        .send(event("order.placed", "e1", json!({})))
        .await
        .unwrap();

    let execution = only_execution(&engine, "C").await;
    assert_eq!(execution.state, ExecutionState::Running);
    assert_eq!(execution.attempts, 1);
    assert_eq!(
        execution.error.as_ref().unwrap().kind,
        ErrorKind::TaskExecution
    );

    let dispatched = engine
        .coordinator()
        .resume_due(Utc::now() + Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(dispatched[0].state, ExecutionState::Completed);
    assert_eq!(dispatched[0].output, Some(json!({"charged": 10})));

    let tasks = engine.coordinator().tasks(&execution.id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].attempts, 2);
    assert_eq!(charge.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn execution_fails_when_retries_are_exhausted() {
    let charge = Arc::new(Charge::declining(usize::MAX));
    let engine = builder(vec![job("C", "order.placed")])
        .handler("C", charge.clone())
        .build();
    engine
        .router()
        .send(event("order.placed", "e1", json!({})))
        .await
        .unwrap();

    for minutes in [5, 10] {
        engine
            .coordinator()
            .resume_due(Utc::now() + Duration::minutes(minutes))
            .await
            .unwrap();
    }

    let execution = only_execution(&engine, "C").await;
    assert_eq!(execution.state, ExecutionState::Failed);
    assert_eq!(execution.attempts, 3);
    assert_eq!(execution.retry_at, None);
    assert_eq!(execution.error.unwrap().kind, ErrorKind::TaskExecution);
    assert!(execution.finished_at.is_some());
    assert_eq!(charge.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn conflicting_params_on_replay_fail_without_retry() {
    let recharge = Arc::new(Recharge::default());
    let engine = builder(vec![job("R", "order.placed")])
        .handler("R", recharge.clone())
        .build();
    engine
        .router()
        .send(event("order.placed", "e1", json!({})))
        .await
        .unwrap();

    let execution = only_execution(&engine, "R").await;
    assert_eq!(execution.state, ExecutionState::Suspended);
    let tasks = engine.coordinator().tasks(&execution.id).await.unwrap();
    let failed = engine
        .coordinator()
        .complete_task(
            &execution.id,
            &tasks[1].id,
            CompleteTaskBodyInput {
                output: json!("r-1"),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(recharge.runs.load(Ordering::SeqCst), 2);
    assert_eq!(failed.state, ExecutionState::Failed);
    assert_eq!(failed.attempts, 1);
    assert_eq!(failed.retry_at, None);
    assert_eq!(
        failed.error.unwrap().kind,
        ErrorKind::IdempotencyConflict
    );

    let tasks = engine.coordinator().tasks(&execution.id).await.unwrap();
    assert_eq!(tasks[0].output, Some(json!({"charged": 10})), "first charge kept");
}

#[tokio::test]
async fn missing_handler_fails_without_retry() {
    let engine = builder(vec![job("N", "user.created")]).build();
    engine
        .router()
        .send(event("user.created", "e1", json!({})))
        .await
        .unwrap();

    let execution = only_execution(&engine, "N").await;
    assert_eq!(execution.state, ExecutionState::Failed);
    assert_eq!(execution.error.unwrap().kind, ErrorKind::Internal);
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

fn mail_job(supports_preparation: bool, local: bool) -> Job {
    let mut job = job("M", "user.created");
    job.supports_preparation = supports_preparation;
    job.connections = vec![JobConnection {
        key: "resend".into(),
        metadata: ConnectionMetadata::default(),
        uses_local_auth: local,
    }];
    job
}

#[tokio::test]
async fn unresolvable_connection_fails_the_execution() {
    let engine = builder(vec![mail_job(false, false)])
        .handler("M", Arc::new(Mailer))
        .build();
    let response = engine
        .router()
        .send(event("user.created", "e1", json!({})))
        .await
        .unwrap();
    assert!(response.delivered_at.is_some());

    let execution = only_execution(&engine, "M").await;
    assert_eq!(execution.state, ExecutionState::Failed);
    assert_eq!(execution.error.unwrap().kind, ErrorKind::AuthResolution);
}

#[tokio::test]
async fn resolved_connection_reaches_the_handler() {
    let creds = InMemoryCredentials::new();
    creds
        .insert(
            "development",
            "resend",
            Credential {
                metadata: ConnectionMetadata::default(),
                auth: ConnectionAuth::ApiKey {
                    api_key: SecretString::from("re_test"),
                },
                expires_at: None,
            },
        )
        .unwrap();
    let engine = builder(vec![mail_job(false, false)])
        .resolver(Arc::new(creds))
        .handler("M", Arc::new(Mailer))
        .build();
    engine
        .router()
        .send(event("user.created", "e1", json!({})))
        .await
        .unwrap();

    let execution = only_execution(&engine, "M").await;
    assert_eq!(execution.state, ExecutionState::Completed);
    assert_eq!(execution.output, Some(json!({"hasKey": true})));
}

#[tokio::test]
async fn prepare_resolves_connections_ahead_of_time() {
    let mut unprepared = job("U", "user.created");
    unprepared.supports_preparation = false;
    let mut local = mail_job(true, true);
    local.id = "L".into();
    let missing = mail_job(true, false);
    let engine = builder(vec![unprepared, local, missing]).build();

    let prepare = |id: &str| PrepareForJobExecutionBody {
        id: id.into(),
        version: "1".into(),
    };

    let response = engine.coordinator().prepare(&prepare("U")).await.unwrap();
    assert!(!response.ok);

    let response = engine.coordinator().prepare(&prepare("L")).await.unwrap();
    assert!(response.ok);

    let err = engine.coordinator().prepare(&prepare("M")).await.unwrap_err();
    assert!(matches!(err, Error::AuthResolution { ref connection, .. } if connection == "resend"));

    let err = engine.coordinator().prepare(&prepare("nope")).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

// ---------------------------------------------------------------------------
// Operator actions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn abort_keeps_completed_tasks_and_refuses_finished_executions() {
    let job = job("J", "user.created");
    let engine = builder(vec![job.clone()]).build();
    let log = engine
        .router()
        .ingest(
            RawEventInput::new("user.created", json!({"id": 7})).id("e1"),
            SendEventOptions::default(),
        )
        .await
        .unwrap();
    let event = engine.store().get_event(&log.id).await.unwrap().event;

    let execution = engine
        .coordinator()
        .create_execution(&job, &event, false)
        .await
        .unwrap();
    assert_eq!(execution.state, ExecutionState::Running);
    engine
        .ledger()
        .run_task(
            &execution.id,
            jobrun_rs::wire::validate::validate_run_task(RunTaskBodyInput::new("a", "step"))
                .unwrap(),
            || async { Ok(json!(1)) },
        )
        .await
        .unwrap();

    let aborted = engine
        .coordinator()
        .abort(&execution.id, "operator request")
        .await
        .unwrap();
    assert_eq!(aborted.state, ExecutionState::Failed);
    let error = aborted.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Aborted);
    assert_eq!(error.message, "operator request");
    assert_eq!(engine.coordinator().tasks(&execution.id).await.unwrap().len(), 1);

    let err = engine
        .coordinator()
        .abort(&execution.id, "again")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
}

#[tokio::test]
async fn deprecated_version_aborts_and_stops_new_executions() {
    let job = job("J", "user.created");
    let engine = builder(vec![job.clone()])
        .handler("J", Arc::new(Approval))
        .build();
    engine
        .router()
        .send(event("user.created", "e1", json!({})))
        .await
        .unwrap();
    let execution = only_execution(&engine, "J").await;
    assert_eq!(execution.state, ExecutionState::Suspended);

    let aborted = engine
        .coordinator()
        .deprecate_job_version("J", "1")
        .await
        .unwrap();
    assert_eq!(aborted, vec![execution.id.clone()]);
    assert!(engine.registry().is_deprecated(&job.job_ref()).unwrap());

    let execution = engine.coordinator().get(&execution.id).await.unwrap();
    assert_eq!(execution.state, ExecutionState::Failed);

    engine
        .router()
        .send(event("user.created", "e2", json!({})))
        .await
        .unwrap();
    assert_eq!(executions_of(&engine, "J").await.len(), 1);

    let e2 = engine.store().get_event(&EventId::from("e2")).await.unwrap().event;
    let err = engine
        .coordinator()
        .create_execution(&job, &e2, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn event_that_does_not_match_is_rejected() {
    let job = job("J", "user.created");
    let engine = builder(vec![job.clone()]).build();
    engine
        .router()
        .ingest(
            RawEventInput::new("user.deleted", json!({})).id("e1"),
            SendEventOptions::default(),
        )
        .await
        .unwrap();
    let event = engine.store().get_event(&EventId::from("e1")).await.unwrap().event;

    let err = engine
        .coordinator()
        .create_execution(&job, &event, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scheduler_delivers_deferred_events_when_due() {
    let greeter = Arc::new(Greeter::default());
    let engine = builder(vec![job("G", "user.created")])
        .handler("G", greeter.clone())
        .build();

    let before = Utc::now();
    let mut body = event("user.created", "e1", json!({"id": 5}));
    body.options.deliver_after = Some(60);
    let response = engine.router().send(body).await.unwrap();
    let deliver_at = response.deliver_at.unwrap();
    assert!(deliver_at >= before + Duration::seconds(60));
    assert!(deliver_at <= Utc::now() + Duration::seconds(60));
    assert_eq!(response.delivered_at, None);

    let scheduler = engine.scheduler();
    assert_eq!(scheduler.tick(Utc::now()).await, Tick::default());
    assert!(executions_of(&engine, "G").await.is_empty());

    let tick = scheduler
        .tick(deliver_at + Duration::seconds(1))
        .await;
    assert_eq!(tick.delivered, 1);
    assert_eq!(greeter.runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        only_execution(&engine, "G").await.state,
        ExecutionState::Completed
    );

    let log = engine.store().get_event(&EventId::from("e1")).await.unwrap();
    assert!(log.delivered_at.is_some());
}

#[tokio::test]
async fn scheduler_stops_on_shutdown() {
    let mut config = EngineConfig::new("app");
    config.poll_interval = std::time::Duration::from_millis(10);
    let engine = Engine::builder(config).build();
    let scheduler = engine.scheduler();

    let running = scheduler.clone();
    let handle = tokio::spawn(async move { running.run().await });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    scheduler.shutdown();

    let result = tokio::time::timeout(std::time::Duration::from_secs(2), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap();
    assert!(result.is_ok());
}
