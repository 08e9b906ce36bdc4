//! Events and their persisted delivery log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::EventId;

/// An accepted event. Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub id: EventId,
    pub name: String,
    pub source: String,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// A persisted event together with its delivery schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLog {
    #[serde(flatten)]
    pub event: RawEvent,
    /// Absolute delivery time. `None` means deliver immediately.
    pub deliver_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    /// Failed delivery attempts so far.
    pub delivery_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl EventLog {
    pub fn new(event: RawEvent, deliver_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        Self {
            event,
            deliver_at,
            delivered_at: None,
            delivery_attempts: 0,
            last_error: None,
            created_at: now,
        }
    }

    pub fn id(&self) -> &EventId {
        &self.event.id
    }

    /// Undelivered and scheduled at or before `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.delivered_at.is_none() && self.deliver_at.is_none_or(|at| at <= now)
    }
}
