//! Event log operations: insert-once, time-ordered due queue, delivery marks.

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{EventId, EventLog, RawEvent};
use crate::store::Inserted;

const EVENT_COLUMNS: &str = "id, name, source, payload, context, event_timestamp, deliver_at, delivered_at, delivery_attempts, last_error, created_at";

impl super::Db {
    /// Insert an event unless its id is already taken.
    pub async fn insert_event(&self, log: &EventLog) -> Result<Inserted<EventLog>> {
        let event = &log.event;
        let inserted: Option<(String,)> = sqlx::query_as(
            "INSERT INTO events (id, name, source, payload, context, event_timestamp, deliver_at, delivered_at, delivery_attempts, last_error, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (id) DO NOTHING
             RETURNING id",
        )
        .bind(event.id.as_str())
        .bind(&event.name)
        .bind(&event.source)
        .bind(&event.payload)
        .bind(&event.context)
        .bind(event.timestamp)
        .bind(log.deliver_at)
        .bind(log.delivered_at)
        .bind(log.delivery_attempts as i32)
        .bind(&log.last_error)
        .bind(log.created_at)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(_) => Ok(Inserted::New(log.clone())),
            None => Ok(Inserted::Existing(self.get_event(&event.id).await?)),
        }
    }

    pub async fn get_event(&self, id: &EventId) -> Result<EventLog> {
        let row: Option<EventRow> =
            sqlx::query_as(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"))
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        row.map(EventLog::from)
            .ok_or_else(|| Error::NotFound(format!("event {id}")))
    }

    /// Undelivered events due at `now`, earliest first.
    pub async fn due_events(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<EventLog>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE delivered_at IS NULL AND COALESCE(deliver_at, created_at) <= $1
             ORDER BY COALESCE(deliver_at, created_at) ASC, id ASC
             LIMIT $2"
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(EventLog::from).collect())
    }

    pub async fn mark_event_delivered(&self, id: &EventId, at: DateTime<Utc>) -> Result<()> {
        let rows_affected = sqlx::query("UPDATE events SET delivered_at = $1 WHERE id = $2")
            .bind(at)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();

        if rows_affected == 0 {
            return Err(Error::NotFound(format!("event {id}")));
        }
        Ok(())
    }

    pub async fn reschedule_event(
        &self,
        id: &EventId,
        deliver_at: DateTime<Utc>,
        attempts: u32,
        error: &str,
    ) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE events SET deliver_at = $1, delivery_attempts = $2, last_error = $3
             WHERE id = $4 AND delivered_at IS NULL",
        )
        .bind(deliver_at)
        .bind(attempts as i32)
        .bind(error)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::NotFound(format!("undelivered event {id}")));
        }
        Ok(())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    name: String,
    source: String,
    payload: serde_json::Value,
    context: Option<serde_json::Value>,
    event_timestamp: DateTime<Utc>,
    deliver_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    delivery_attempts: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<EventRow> for EventLog {
    fn from(row: EventRow) -> Self {
        EventLog {
            event: RawEvent {
                id: EventId(row.id),
                name: row.name,
                source: row.source,
                payload: row.payload,
                context: row.context,
                timestamp: row.event_timestamp,
            },
            deliver_at: row.deliver_at,
            delivered_at: row.delivered_at,
            delivery_attempts: row.delivery_attempts as u32,
            last_error: row.last_error,
            created_at: row.created_at,
        }
    }
}
