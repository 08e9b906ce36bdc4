//! Execution records: insert-once per (job version, event), guarded
//! transitions.

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{
    Execution, ExecutionError, ExecutionId, ExecutionPatch, ExecutionState, JobRef,
};
use crate::store::{Inserted, validate_transition};

const EXECUTION_COLUMNS: &str = "id, job_id, job_version, event, context, state, attempts, retry_at, resume_at, suspended_at, output, error, created_at, updated_at, finished_at";

impl super::Db {
    /// Insert an execution unless one exists for the same job version and
    /// event.
    pub async fn insert_execution(&self, execution: &Execution) -> Result<Inserted<Execution>> {
        let inserted: Option<(String,)> = sqlx::query_as(
            "INSERT INTO executions (id, job_id, job_version, event_id, event, context, state, attempts, retry_at, resume_at, suspended_at, output, error, created_at, updated_at, finished_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
             ON CONFLICT (job_id, job_version, event_id) DO NOTHING
             RETURNING id",
        )
        .bind(execution.id.as_str())
        .bind(&execution.job.id)
        .bind(&execution.job.version)
        .bind(execution.event.id.as_str())
        .bind(serde_json::to_value(&execution.event)?)
        .bind(serde_json::to_value(&execution.context)?)
        .bind(execution.state.to_string())
        .bind(execution.attempts as i32)
        .bind(execution.retry_at)
        .bind(execution.resume_at)
        .bind(execution.suspended_at)
        .bind(&execution.output)
        .bind(execution.error.as_ref().map(serde_json::to_value).transpose()?)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .bind(execution.finished_at)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            return Ok(Inserted::New(self.get_execution(&execution.id).await?));
        }

        let row: ExecutionRow = sqlx::query_as(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions
             WHERE job_id = $1 AND job_version = $2 AND event_id = $3"
        ))
        .bind(&execution.job.id)
        .bind(&execution.job.version)
        .bind(execution.event.id.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(Inserted::Existing(row.try_into_execution()?))
    }

    pub async fn get_execution(&self, id: &ExecutionId) -> Result<Execution> {
        let row: Option<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("execution {id}")))?
            .try_into_execution()
    }

    /// Transition an execution's state with optimistic concurrency.
    ///
    /// The row is locked for the read-modify-write so that the `from` check
    /// and the patch apply atomically.
    pub async fn transition_execution(
        &self,
        id: &ExecutionId,
        from: ExecutionState,
        to: ExecutionState,
        patch: ExecutionPatch,
    ) -> Result<Execution> {
        validate_transition(from, to)?;
        self.update_locked(id, from, to, patch).await
    }

    /// Patch bookkeeping fields while the state stays `expected`.
    pub async fn patch_execution(
        &self,
        id: &ExecutionId,
        expected: ExecutionState,
        patch: ExecutionPatch,
    ) -> Result<Execution> {
        self.update_locked(id, expected, expected, patch).await
    }

    async fn update_locked(
        &self,
        id: &ExecutionId,
        from: ExecutionState,
        to: ExecutionState,
        patch: ExecutionPatch,
    ) -> Result<Execution> {
        let mut tx = self.pool.begin().await?;

        let row: Option<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let mut execution = row
            .ok_or_else(|| Error::NotFound(format!("execution {id}")))?
            .try_into_execution()?;

        if execution.state != from {
            return Err(Error::InvalidTransition {
                from: execution.state.to_string(),
                to: to.to_string(),
            });
        }

        patch.apply(&mut execution, to, Utc::now());

        sqlx::query(
            "UPDATE executions SET state = $1, attempts = $2, retry_at = $3, resume_at = $4, suspended_at = $5,
                 output = $6, error = $7, updated_at = $8, finished_at = $9
             WHERE id = $10",
        )
        .bind(execution.state.to_string())
        .bind(execution.attempts as i32)
        .bind(execution.retry_at)
        .bind(execution.resume_at)
        .bind(execution.suspended_at)
        .bind(&execution.output)
        .bind(execution.error.as_ref().map(serde_json::to_value).transpose()?)
        .bind(execution.updated_at)
        .bind(execution.finished_at)
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(execution)
    }

    pub async fn list_executions(&self, state: ExecutionState) -> Result<Vec<Execution>> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE state = $1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(state.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(ExecutionRow::try_into_execution)
            .collect()
    }

    pub async fn list_executions_for_job(&self, job: &JobRef) -> Result<Vec<Execution>> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions
             WHERE job_id = $1 AND job_version = $2 ORDER BY created_at ASC, id ASC"
        ))
        .bind(&job.id)
        .bind(&job.version)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(ExecutionRow::try_into_execution)
            .collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: String,
    job_id: String,
    job_version: String,
    event: serde_json::Value,
    context: serde_json::Value,
    state: String,
    attempts: i32,
    retry_at: Option<DateTime<Utc>>,
    resume_at: Option<DateTime<Utc>>,
    suspended_at: Option<DateTime<Utc>>,
    output: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl ExecutionRow {
    fn try_into_execution(self) -> Result<Execution> {
        let error: Option<ExecutionError> = self.error.map(serde_json::from_value).transpose()?;

        Ok(Execution {
            id: ExecutionId(self.id),
            job: JobRef {
                id: self.job_id,
                version: self.job_version,
            },
            event: serde_json::from_value(self.event)?,
            context: serde_json::from_value(self.context)?,
            connections: Default::default(),
            state: self.state.parse()?,
            attempts: self.attempts as u32,
            retry_at: self.retry_at,
            resume_at: self.resume_at,
            suspended_at: self.suspended_at,
            output: self.output,
            error,
            created_at: self.created_at,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
        })
    }
}
