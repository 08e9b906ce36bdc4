//! Database connection pool, migrations, and health check.
//!
//! The Postgres-backed [`Store`]. Each concern lives in its own submodule
//! as an `impl Db` block; the trait impl below only delegates.

pub mod events;
pub mod executions;
pub mod tasks;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::Result;
use crate::model::{
    EventId, EventLog, Execution, ExecutionId, ExecutionPatch, ExecutionState, JobRef, Task,
    TaskId,
};
use crate::store::{Inserted, Store};

/// Database handle. Owns the connection pool shared across all modules.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::error::Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for Db {
    async fn insert_event(&self, event: &EventLog) -> Result<Inserted<EventLog>> {
        Db::insert_event(self, event).await
    }

    async fn get_event(&self, id: &EventId) -> Result<EventLog> {
        Db::get_event(self, id).await
    }

    async fn due_events(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<EventLog>> {
        Db::due_events(self, now, limit).await
    }

    async fn mark_event_delivered(&self, id: &EventId, at: DateTime<Utc>) -> Result<()> {
        Db::mark_event_delivered(self, id, at).await
    }

    async fn reschedule_event(
        &self,
        id: &EventId,
        deliver_at: DateTime<Utc>,
        attempts: u32,
        error: &str,
    ) -> Result<()> {
        Db::reschedule_event(self, id, deliver_at, attempts, error).await
    }

    async fn insert_execution(&self, execution: &Execution) -> Result<Inserted<Execution>> {
        Db::insert_execution(self, execution).await
    }

    async fn get_execution(&self, id: &ExecutionId) -> Result<Execution> {
        Db::get_execution(self, id).await
    }

    async fn transition_execution(
        &self,
        id: &ExecutionId,
        from: ExecutionState,
        to: ExecutionState,
        patch: ExecutionPatch,
    ) -> Result<Execution> {
        Db::transition_execution(self, id, from, to, patch).await
    }

    async fn patch_execution(
        &self,
        id: &ExecutionId,
        expected: ExecutionState,
        patch: ExecutionPatch,
    ) -> Result<Execution> {
        Db::patch_execution(self, id, expected, patch).await
    }

    async fn list_executions(&self, state: ExecutionState) -> Result<Vec<Execution>> {
        Db::list_executions(self, state).await
    }

    async fn list_executions_for_job(&self, job: &JobRef) -> Result<Vec<Execution>> {
        Db::list_executions_for_job(self, job).await
    }

    async fn insert_task(&self, task: &Task) -> Result<Inserted<Task>> {
        Db::insert_task(self, task).await
    }

    async fn find_task(&self, execution_id: &ExecutionId, key: &str) -> Result<Option<Task>> {
        Db::find_task(self, execution_id, key).await
    }

    async fn get_task(&self, id: &TaskId) -> Result<Task> {
        Db::get_task(self, id).await
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        Db::update_task(self, task).await
    }

    async fn claim_task(
        &self,
        task: &Task,
        owner: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        Db::claim_task(self, task, owner, lease_until, now).await
    }

    async fn renew_task_lease(
        &self,
        id: &TaskId,
        owner: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        Db::renew_task_lease(self, id, owner, lease_until).await
    }

    async fn list_tasks(&self, execution_id: &ExecutionId) -> Result<Vec<Task>> {
        Db::list_tasks(self, execution_id).await
    }
}
