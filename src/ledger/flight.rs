//! Per-key single-flight table.
//!
//! The first caller for a `(execution, idempotency key)` pair becomes the
//! leader and runs the side effect; concurrent callers for the same pair
//! follow and receive the leader's result. Entries are removed when the
//! leader's guard drops, including on cancellation.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;

use super::TaskResult;
use crate::error::{Error, Result};
use crate::model::ExecutionId;

type FlightKey = (ExecutionId, String);
type Slot = Option<TaskResult>;

#[derive(Debug, Default)]
pub struct FlightTable {
    inflight: Mutex<HashMap<FlightKey, watch::Receiver<Slot>>>,
}

pub enum Flight<'a> {
    Leader(FlightGuard<'a>),
    Follower(watch::Receiver<Slot>),
}

impl FlightTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for a key, leading it if none is in progress.
    pub fn join(&self, execution_id: &ExecutionId, key: &str) -> Result<Flight<'_>> {
        let flight_key = (execution_id.clone(), key.to_string());
        let mut inflight = self
            .inflight
            .lock()
            .map_err(|_| Error::Other("flight table lock poisoned".to_string()))?;

        if let Some(rx) = inflight.get(&flight_key) {
            return Ok(Flight::Follower(rx.clone()));
        }

        let (tx, rx) = watch::channel(None);
        inflight.insert(flight_key.clone(), rx);
        Ok(Flight::Leader(FlightGuard {
            table: self,
            key: flight_key,
            tx,
        }))
    }

    /// Number of keys currently in flight.
    pub fn len(&self) -> usize {
        self.inflight.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held by the leader for the duration of the side effect.
pub struct FlightGuard<'a> {
    table: &'a FlightTable,
    key: FlightKey,
    tx: watch::Sender<Slot>,
}

impl FlightGuard<'_> {
    /// Publish the leader's result to every follower.
    pub fn finish(self, result: &TaskResult) {
        self.tx.send_replace(Some(result.clone()));
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut inflight) = self.table.inflight.lock() {
            inflight.remove(&self.key);
        }
    }
}

/// Wait for the leader. `None` means it went away without a result and the
/// caller should try again.
pub async fn wait(mut rx: watch::Receiver<Slot>) -> Option<TaskResult> {
    match rx.wait_for(Option::is_some).await {
        Ok(slot) => slot.clone(),
        Err(_) => None,
    }
}
