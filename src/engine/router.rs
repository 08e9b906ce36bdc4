//! Event router: accept events, schedule them, deliver them to matching
//! jobs.
//!
//! Delivery is at least once. Redelivering an event is harmless: execution
//! creation is idempotent per (job version, event) and task replay absorbs
//! the rest.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::coordinator::Coordinator;
use crate::config::EngineConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::model::{EventLog, Execution, ExecutionError, IdGenerator, RawEvent};
use crate::registry::JobRegistry;
use crate::store::Store;
use crate::telemetry::metrics;
use crate::wire::validate::{validate_raw_event, validate_send_event, validate_send_options};
use crate::wire::{RawEventInput, SendEventBody, SendEventOptions, SendEventResponse};

pub struct Router {
    store: Arc<dyn Store>,
    registry: Arc<JobRegistry>,
    coordinator: Arc<Coordinator>,
    ids: Arc<dyn IdGenerator>,
    config: EngineConfig,
}

impl Router {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<JobRegistry>,
        coordinator: Arc<Coordinator>,
        ids: Arc<dyn IdGenerator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            coordinator,
            ids,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Normalize and persist an event for later delivery.
    ///
    /// A second event with an existing id is not stored; the response
    /// describes the original.
    pub async fn ingest(
        &self,
        input: RawEventInput,
        options: SendEventOptions,
    ) -> Result<SendEventResponse> {
        validate_raw_event(&input)?;
        validate_send_options(&options)?;

        let now = Utc::now();
        let event = input.normalize(|| self.ids.next(), &self.config.default_event_source, now);
        let deliver_at = match (options.deliver_at, options.deliver_after) {
            (Some(at), _) => Some(at),
            (None, Some(secs)) => {
                let secs = i64::try_from(secs)
                    .map_err(|_| Error::Validation(format!("deliverAfter {secs} too large")))?;
                let delay = chrono::Duration::try_seconds(secs)
                    .ok_or_else(|| Error::Validation(format!("deliverAfter {secs} too large")))?;
                Some(now + delay)
            }
            (None, None) => None,
        };

        let source = event.source.clone();
        let inserted = self
            .store
            .insert_event(&EventLog::new(event, deliver_at, now))
            .await?;
        let is_new = inserted.is_new();
        let log = inserted.into_inner();

        metrics::events_ingested().add(
            1,
            &[
                KeyValue::new("source", source),
                KeyValue::new("result", if is_new { "new" } else { "duplicate" }),
            ],
        );
        if is_new {
            info!(event_id = %log.id(), name = %log.event.name, deliver_at = ?log.deliver_at, "event accepted");
        } else {
            debug!(event_id = %log.id(), "duplicate event id, keeping original");
        }

        Ok(SendEventResponse {
            id: log.id().clone(),
            deliver_at: log.deliver_at,
            delivered_at: None,
        })
    }

    /// Start and dispatch an execution for every active job the event
    /// triggers.
    pub async fn deliver(&self, event: &RawEvent) -> Result<Vec<Execution>> {
        let jobs = self.registry.matching(event)?;
        if jobs.is_empty() {
            debug!(event_id = %event.id, name = %event.name, "no job triggered");
        }

        let mut executions = Vec::with_capacity(jobs.len());
        for job in jobs {
            let created = match self.coordinator.create_execution(&job, event, false).await {
                Ok(execution) => execution,
                Err(err @ Error::AuthResolution { .. }) => {
                    // Persisted as FAILED; redelivery cannot help.
                    warn!(event_id = %event.id, job = %job.job_ref(), error = %err, "execution not started");
                    continue;
                }
                Err(err) => return Err(err),
            };
            executions.push(self.coordinator.dispatch(&created.id).await?);
        }
        Ok(executions)
    }

    /// Ingest, then deliver right away when the event is already due.
    pub async fn send(&self, body: SendEventBody) -> Result<SendEventResponse> {
        validate_send_event(&body)?;
        let mut response = self.ingest(body.event, body.options).await?;

        let now = Utc::now();
        if response.deliver_at.is_some_and(|at| at > now) {
            return Ok(response);
        }

        let log = self.store.get_event(&response.id).await?;
        if log.delivered_at.is_some() {
            response.delivered_at = log.delivered_at;
            return Ok(response);
        }
        if self.deliver_log(&log, now).await? {
            response.delivered_at = Some(now);
        }
        Ok(response)
    }

    /// Deliver every event due at `now`, earliest first. Returns how many
    /// were delivered.
    pub async fn deliver_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self
            .store
            .due_events(now, self.config.delivery_batch)
            .await?;

        let mut delivered = 0;
        for log in &due {
            if self.deliver_log(log, now).await? {
                delivered += 1;
            }
        }
        if !due.is_empty() {
            debug!(due = due.len(), delivered, "delivery pass finished");
        }
        Ok(delivered)
    }

    /// Deliver one logged event, rescheduling it with backoff on failure.
    async fn deliver_log(&self, log: &EventLog, now: DateTime<Utc>) -> Result<bool> {
        let err = match self.deliver(&log.event).await {
            Ok(_) => {
                self.store.mark_event_delivered(log.id(), now).await?;
                metrics::event_deliveries().add(1, &[KeyValue::new("result", "delivered")]);
                return Ok(true);
            }
            Err(err) => Error::Delivery(err.to_string()),
        };

        let attempts = log.delivery_attempts + 1;
        let policy = &self.config.delivery_retry;
        if policy.should_retry(attempts) {
            let retry_at = policy.next_at(attempts, now);
            warn!(event_id = %log.id(), attempts, %retry_at, error = %err, "delivery failed, rescheduled");
            self.store
                .reschedule_event(log.id(), retry_at, attempts, &err.to_string())
                .await?;
            metrics::event_deliveries().add(1, &[KeyValue::new("result", "retry")]);
            return Ok(false);
        }

        error!(event_id = %log.id(), attempts, error = %err, "delivery attempts exhausted");
        self.fail_event_executions(&log.event, &err).await?;
        self.store
            .reschedule_event(log.id(), now, attempts, &err.to_string())
            .await?;
        self.store.mark_event_delivered(log.id(), now).await?;
        metrics::event_deliveries().add(1, &[KeyValue::new("result", "exhausted")]);
        Ok(false)
    }

    /// Fail the unfinished executions an undeliverable event started.
    async fn fail_event_executions(&self, event: &RawEvent, err: &Error) -> Result<()> {
        for job in self.registry.matching(event)? {
            for execution in self.store.list_executions_for_job(&job.job_ref()).await? {
                if execution.event.id != event.id || execution.state.is_terminal() {
                    continue;
                }
                let error = ExecutionError::new(ErrorKind::Delivery, err.to_string());
                match self.coordinator.fail_with(&execution.id, error).await {
                    Ok(_) | Err(Error::InvalidTransition { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}
