//! PostgreSQL implementation of TaskStore
//!
//! Production persistence over one `deferred_<category>` table per category:
//! - claiming is a single statement (CTE + FOR UPDATE SKIP LOCKED + UPDATE),
//!   so two pollers can never select the same row
//! - outcome writes are conditional on `status = 'PROCESSING'` and report a
//!   conflict when the row moved underneath the worker
//! - schema ownership (DDL, migrations, connection sizing) stays with the
//!   host process; `validate_schema` only verifies the required columns
//!
//! Expected column set per table: see [`REQUIRED_COLUMNS`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::{StoreError, TaskOutcome, TaskStore, REQUIRED_COLUMNS};
use crate::task::{validate_category, NewTask, TaskRecord, TaskStatus};

/// PostgreSQL implementation of [`TaskStore`].
///
/// # Example
///
/// ```ignore
/// use deferq::PostgresTaskStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/deferq").await?;
/// let store = PostgresTaskStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Category table name; the category alphabet is validated first, which
    /// is what makes the identifier interpolation below safe.
    fn table(category: &str) -> Result<String, StoreError> {
        validate_category(category)
            .map_err(|_| StoreError::InvalidCategory(category.to_string()))?;
        Ok(format!("deferred_{category}"))
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<TaskRecord, StoreError> {
    let status: String = row.get("status");
    let status: TaskStatus = status.parse().map_err(StoreError::Serialization)?;

    Ok(TaskRecord {
        id: row.get("id"),
        category: row.get("category"),
        task_class: row.get("task_class"),
        params: row.get("params"),
        status,
        scheduled_time: row.get("scheduled_time"),
        next_attempt_time: row.get("next_attempt_time"),
        max_attempts: row.get::<i32, _>("max_attempts") as u32,
        exponential_backoff: row.get("exponential_backoff"),
        backoff_base: row.get("backoff_base"),
        max_backoff_ms: row.get::<i64, _>("max_backoff_ms") as u64,
        attempt_count: row.get::<i32, _>("attempt_count") as u32,
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
        processing_since: row.get("processing_since"),
    })
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, task), fields(category = %task.category, task_class = %task.task_class))]
    async fn insert(&self, task: NewTask) -> Result<Uuid, StoreError> {
        let table = Self::table(&task.category)?;
        let id = Uuid::now_v7();

        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (
                id, category, task_class, params, status, scheduled_time,
                max_attempts, exponential_backoff, backoff_base, max_backoff_ms,
                attempt_count, created_at
            )
            VALUES ($1, $2, $3, $4, 'PENDING', $5, $6, $7, $8, $9, 0, $10)
            "#
        ))
        .bind(id)
        .bind(&task.category)
        .bind(&task.task_class)
        .bind(&task.params)
        .bind(task.scheduled_time)
        .bind(task.retry.max_attempts as i32)
        .bind(task.retry.exponential)
        .bind(task.retry.base)
        .bind(task.retry.max_backoff.as_millis() as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert task: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(%id, "inserted task");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn update_status(
        &self,
        category: &str,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<bool, StoreError> {
        let table = Self::table(category)?;

        let result = sqlx::query(&format!(
            r#"
            UPDATE {table} SET status = $3 WHERE id = $1 AND status = $2
            "#
        ))
        .bind(id)
        .bind(from.to_string())
        .bind(to.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update task status: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn claim_due_batch(
        &self,
        category: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let table = Self::table(category)?;

        // One atomic statement: select due rows with SKIP LOCKED so a
        // concurrent poller's in-flight claim is invisible here, and flip
        // them to PROCESSING in the same operation. next_attempt_time, once
        // set by a retry, supersedes scheduled_time as the due time.
        let rows = sqlx::query(&format!(
            r#"
            WITH due AS (
                SELECT id
                FROM {table}
                WHERE status = 'PENDING'
                  AND COALESCE(next_attempt_time, scheduled_time) <= $1
                ORDER BY scheduled_time
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {table} t
            SET status = 'PROCESSING',
                processing_since = $1
            FROM due d
            WHERE t.id = d.id
            RETURNING t.id, t.category, t.task_class, t.params, t.status,
                      t.scheduled_time, t.next_attempt_time, t.max_attempts,
                      t.exponential_backoff, t.backoff_base, t.max_backoff_ms,
                      t.attempt_count, t.created_at, t.completed_at,
                      t.processing_since
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim tasks: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let claimed = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        if !claimed.is_empty() {
            debug!(category, count = claimed.len(), "claimed tasks");
        }
        Ok(claimed)
    }

    #[instrument(skip(self, outcome), fields(status = %outcome.status()))]
    async fn record_outcome(
        &self,
        category: &str,
        id: Uuid,
        outcome: TaskOutcome,
    ) -> Result<(), StoreError> {
        let table = Self::table(category)?;

        let (status, attempt_count) = (outcome.status(), outcome.attempt_count());
        let (completed_at, next_attempt_time): (Option<DateTime<Utc>>, Option<DateTime<Utc>>) =
            match outcome {
                TaskOutcome::Completed { completed_at, .. } => (Some(completed_at), None),
                TaskOutcome::Failed { .. } => (None, None),
                TaskOutcome::Retry {
                    next_attempt_time, ..
                } => (None, Some(next_attempt_time)),
            };

        let result = sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET status = $2,
                attempt_count = $3,
                completed_at = COALESCE($4, completed_at),
                next_attempt_time = COALESCE($5, next_attempt_time),
                processing_since = NULL
            WHERE id = $1 AND status = 'PROCESSING'
            "#
        ))
        .bind(id)
        .bind(status.to_string())
        .bind(attempt_count as i32)
        .bind(completed_at)
        .bind(next_attempt_time)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to record task outcome: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                id,
                expected: TaskStatus::Processing,
            });
        }

        debug!(%id, %status, attempt_count, "recorded task outcome");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, category: &str, id: Uuid) -> Result<TaskRecord, StoreError> {
        let table = Self::table(category)?;

        let row = sqlx::query(&format!(
            r#"
            SELECT id, category, task_class, params, status, scheduled_time,
                   next_attempt_time, max_attempts, exponential_backoff,
                   backoff_base, max_backoff_ms, attempt_count, created_at,
                   completed_at, processing_since
            FROM {table}
            WHERE id = $1
            "#
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get task: {}", e);
            StoreError::Database(e.to_string())
        })?
        .ok_or(StoreError::TaskNotFound(id))?;

        record_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn validate_schema(&self, category: &str) -> Result<(), StoreError> {
        let table = Self::table(category)?;

        let rows = sqlx::query(
            r#"
            SELECT column_name
            FROM information_schema.columns
            WHERE table_name = $1
            "#,
        )
        .bind(&table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to validate schema: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let present: Vec<String> = rows
            .iter()
            .map(|r| r.get::<String, _>("column_name"))
            .collect();

        let missing: Vec<String> = REQUIRED_COLUMNS
            .iter()
            .filter(|c| !present.iter().any(|p| p == *c))
            .map(|c| c.to_string())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Schema {
                category: category.to_string(),
                missing,
            })
        }
    }

    #[instrument(skip(self))]
    async fn reclaim_stale(
        &self,
        category: &str,
        visibility_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let table = Self::table(category)?;
        let cutoff = chrono::TimeDelta::from_std(visibility_timeout)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let rows = sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET status = 'PENDING',
                processing_since = NULL
            WHERE status = 'PROCESSING' AND processing_since < $1
            RETURNING id
            "#
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to reclaim stale tasks: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    #[instrument(skip(self))]
    async fn count_by_status(
        &self,
        category: &str,
        status: TaskStatus,
    ) -> Result<u64, StoreError> {
        let table = Self::table(category)?;

        let row = sqlx::query(&format!(
            r#"
            SELECT COUNT(*) AS n FROM {table} WHERE status = $1
            "#
        ))
        .bind(status.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to count tasks: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(row.get::<i64, _>("n") as u64)
    }
}
