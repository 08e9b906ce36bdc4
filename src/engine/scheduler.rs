//! Scheduler loop: delivers due events, resumes due executions, abandons
//! stale suspensions.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info};

use super::coordinator::Coordinator;
use super::router::Router;
use crate::error::Result;

/// What one scheduler pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub delivered: usize,
    pub resumed: usize,
    pub abandoned: usize,
    /// Steps of the pass that failed; the others still ran.
    pub failed: usize,
}

#[derive(Clone)]
pub struct Scheduler {
    router: Arc<Router>,
    coordinator: Arc<Coordinator>,
    poll_interval: std::time::Duration,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    pub fn new(router: Arc<Router>, coordinator: Arc<Coordinator>) -> Self {
        let poll_interval = coordinator.config().poll_interval;
        Self {
            router,
            coordinator,
            poll_interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Signal the loop to stop after the current pass.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run until [`Scheduler::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        info!(poll_ms = self.poll_interval.as_millis() as u64, "scheduler started");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("scheduler shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            self.tick(Utc::now()).await;
        }
    }

    /// One pass over everything due at `now`. Delivery, resumption and
    /// abandonment run independently: a failed step is logged and counted.
    pub async fn tick(&self, now: DateTime<Utc>) -> Tick {
        let mut failed = 0;
        let delivered = step(
            &mut failed,
            "deliver due events",
            self.router.deliver_due(now).await,
        );
        let resumed = step(
            &mut failed,
            "resume due executions",
            self.coordinator.resume_due(now).await.map(|resumed| resumed.len()),
        );
        let abandoned = step(
            &mut failed,
            "abandon stale suspensions",
            self.coordinator.abandon_stale(now).await.map(|abandoned| abandoned.len()),
        );

        let tick = Tick {
            delivered,
            resumed,
            abandoned,
            failed,
        };
        if tick != Tick::default() {
            info!(delivered, resumed, abandoned, failed, "scheduler pass");
        }
        tick
    }
}

fn step(failed: &mut usize, name: &str, result: Result<usize>) -> usize {
    result.unwrap_or_else(|e| {
        error!(step = name, error = %e, "scheduler step failed");
        *failed += 1;
        0
    })
}
