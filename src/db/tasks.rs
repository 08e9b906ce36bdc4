//! Task ledger persistence.

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{DisplayProperty, ExecutionId, Task, TaskFailure, TaskId};
use crate::store::Inserted;

const TASK_COLUMNS: &str = "id, execution_id, name, idempotency_key, params, output, error, status, delay_until, noop, elements, description, attempts, created_at, completed_at, claimed_by, lease_until";

impl super::Db {
    /// Insert a task unless its idempotency key is already recorded for the
    /// execution.
    pub async fn insert_task(&self, task: &Task) -> Result<Inserted<Task>> {
        let inserted: Option<(String,)> = sqlx::query_as(
            "INSERT INTO tasks (id, execution_id, name, idempotency_key, params, output, error, status, delay_until, noop, elements, description, attempts, created_at, completed_at, claimed_by, lease_until)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
             ON CONFLICT (execution_id, idempotency_key) DO NOTHING
             RETURNING id",
        )
        .bind(task.id.as_str())
        .bind(task.execution_id.as_str())
        .bind(&task.name)
        .bind(&task.idempotency_key)
        .bind(&task.params)
        .bind(&task.output)
        .bind(task.error.as_ref().map(serde_json::to_value).transpose()?)
        .bind(task.status.to_string())
        .bind(task.delay_until)
        .bind(task.noop)
        .bind(task.elements.as_ref().map(serde_json::to_value).transpose()?)
        .bind(&task.description)
        .bind(task.attempts as i32)
        .bind(task.created_at)
        .bind(task.completed_at)
        .bind(&task.claimed_by)
        .bind(task.lease_until)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_some() {
            return Ok(Inserted::New(task.clone()));
        }

        let existing = self
            .find_task(&task.execution_id, &task.idempotency_key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {}", task.idempotency_key)))?;
        Ok(Inserted::Existing(existing))
    }

    pub async fn find_task(&self, execution_id: &ExecutionId, key: &str) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE execution_id = $1 AND idempotency_key = $2"
        ))
        .bind(execution_id.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TaskRow::try_into_task).transpose()
    }

    pub async fn get_task(&self, id: &TaskId) -> Result<Task> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or_else(|| Error::NotFound(format!("task {id}")))?
            .try_into_task()
    }

    pub async fn update_task(&self, task: &Task) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE tasks SET status = $1, output = $2, error = $3, attempts = $4, completed_at = $5,
                 elements = $6, description = $7, claimed_by = $8, lease_until = $9
             WHERE id = $10",
        )
        .bind(task.status.to_string())
        .bind(&task.output)
        .bind(task.error.as_ref().map(serde_json::to_value).transpose()?)
        .bind(task.attempts as i32)
        .bind(task.completed_at)
        .bind(task.elements.as_ref().map(serde_json::to_value).transpose()?)
        .bind(&task.description)
        .bind(&task.claimed_by)
        .bind(task.lease_until)
        .bind(task.id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::NotFound(format!("task {}", task.id)));
        }
        Ok(())
    }

    /// Conditional claim: the `WHERE` clause is the whole concurrency
    /// control, so two processes racing for one task cannot both win.
    pub async fn claim_task(
        &self,
        task: &Task,
        owner: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "UPDATE tasks SET status = 'RUNNING', attempts = attempts + 1, error = NULL,
                 claimed_by = $1, lease_until = $2
             WHERE id = $3 AND status = $4 AND attempts = $5
               AND (status <> 'RUNNING' OR claimed_by IS NULL OR claimed_by = $1
                    OR lease_until IS NULL OR lease_until <= $6)
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(owner)
        .bind(lease_until)
        .bind(task.id.as_str())
        .bind(task.status.to_string())
        .bind(task.attempts as i32)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TaskRow::try_into_task).transpose()
    }

    pub async fn renew_task_lease(
        &self,
        id: &TaskId,
        owner: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE tasks SET lease_until = $1
             WHERE id = $2 AND status = 'RUNNING' AND claimed_by = $3",
        )
        .bind(lease_until)
        .bind(id.as_str())
        .bind(owner)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    /// Tasks in creation order.
    pub async fn list_tasks(&self, execution_id: &ExecutionId) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE execution_id = $1 ORDER BY seq ASC"
        ))
        .bind(execution_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TaskRow::try_into_task).collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    execution_id: String,
    name: String,
    idempotency_key: String,
    params: Option<serde_json::Value>,
    output: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
    status: String,
    delay_until: Option<DateTime<Utc>>,
    noop: bool,
    elements: Option<serde_json::Value>,
    description: Option<String>,
    attempts: i32,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    claimed_by: Option<String>,
    lease_until: Option<DateTime<Utc>>,
}

impl TaskRow {
    fn try_into_task(self) -> Result<Task> {
        let error: Option<TaskFailure> = self.error.map(serde_json::from_value).transpose()?;
        let elements: Option<Vec<DisplayProperty>> =
            self.elements.map(serde_json::from_value).transpose()?;

        Ok(Task {
            id: TaskId(self.id),
            execution_id: ExecutionId(self.execution_id),
            name: self.name,
            idempotency_key: self.idempotency_key,
            params: self.params,
            output: self.output,
            error,
            status: self.status.parse()?,
            delay_until: self.delay_until,
            noop: self.noop,
            elements,
            description: self.description,
            attempts: self.attempts as u32,
            created_at: self.created_at,
            completed_at: self.completed_at,
            claimed_by: self.claimed_by,
            lease_until: self.lease_until,
        })
    }
}
