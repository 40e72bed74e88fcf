//! TaskStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::task::{NewTask, TaskRecord, TaskStatus};

/// Columns every category table must carry for the engine to operate.
///
/// Checked by [`TaskStore::validate_schema`] before a worker starts.
pub const REQUIRED_COLUMNS: &[&str] = &[
    "id",
    "category",
    "task_class",
    "params",
    "status",
    "scheduled_time",
    "next_attempt_time",
    "max_attempts",
    "exponential_backoff",
    "backoff_base",
    "max_backoff_ms",
    "attempt_count",
    "created_at",
    "completed_at",
    "processing_since",
];

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Category table missing required columns; fatal to worker init
    #[error("schema for category {category:?} is missing columns: {missing:?}")]
    Schema {
        category: String,
        missing: Vec<String>,
    },

    /// Row was not in the expected status when a conditional write ran
    #[error("write conflict on task {id}: row no longer {expected}")]
    Conflict { id: Uuid, expected: TaskStatus },

    /// Category name unusable as a table partition
    #[error("invalid category: {0:?}")]
    InvalidCategory(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// The single atomic write that moves a task out of PROCESSING.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Execution succeeded
    Completed {
        attempt_count: u32,
        completed_at: DateTime<Utc>,
    },

    /// Attempts exhausted
    Failed { attempt_count: u32 },

    /// Execution failed with attempts remaining; row becomes PENDING again
    /// and is eligible once the due-time filter passes `next_attempt_time`
    Retry {
        attempt_count: u32,
        next_attempt_time: DateTime<Utc>,
    },
}

impl TaskOutcome {
    /// The status this outcome writes.
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Completed { .. } => TaskStatus::Completed,
            Self::Failed { .. } => TaskStatus::Failed,
            Self::Retry { .. } => TaskStatus::Pending,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        match self {
            Self::Completed { attempt_count, .. }
            | Self::Failed { attempt_count }
            | Self::Retry { attempt_count, .. } => *attempt_count,
        }
    }
}

/// Persistence port for category-partitioned task tables.
///
/// Implementations must be thread-safe and support concurrent access; the
/// claim operation is the synchronization primitive the whole engine relies
/// on, so its atomicity requirements are strict (see [`claim_due_batch`]).
///
/// [`claim_due_batch`]: TaskStore::claim_due_batch
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    /// Insert a new task row (status PENDING, attempt_count 0) and return the
    /// store-assigned id.
    async fn insert(&self, task: NewTask) -> Result<Uuid, StoreError>;

    /// Conditionally transition a row's status.
    ///
    /// This is the compare-and-swap primitive behind cancel: the transition
    /// happens only if the row is still in `from`, and the return value says
    /// whether it did. Never a read followed by a write.
    async fn update_status(
        &self,
        category: &str,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<bool, StoreError>;

    /// Claim up to `limit` due PENDING rows, oldest `scheduled_time` first.
    ///
    /// A row is due when `scheduled_time <= now` or `next_attempt_time <=
    /// now`. Each selected row is transitioned to PROCESSING as part of the
    /// same locking read; rows concurrently locked by another claimer are
    /// skipped, so two pollers never return the same row.
    async fn claim_due_batch(
        &self,
        category: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    /// Record an execution outcome as one atomic update keyed by `id`,
    /// conditional on the row still being PROCESSING.
    ///
    /// A concurrent modification surfaces as [`StoreError::Conflict`]; the
    /// caller logs it and does not re-attempt (the row is then recoverable
    /// only by the stale-reclamation sweep).
    async fn record_outcome(
        &self,
        category: &str,
        id: Uuid,
        outcome: TaskOutcome,
    ) -> Result<(), StoreError>;

    /// Fetch a single task row.
    async fn get(&self, category: &str, id: Uuid) -> Result<TaskRecord, StoreError>;

    /// Verify the category table carries [`REQUIRED_COLUMNS`].
    async fn validate_schema(&self, category: &str) -> Result<(), StoreError>;

    /// Return PROCESSING rows whose claim is older than `visibility_timeout`
    /// to PENDING, and report which ids were requeued.
    async fn reclaim_stale(
        &self,
        category: &str,
        visibility_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Count rows in a category by status.
    async fn count_by_status(&self, category: &str, status: TaskStatus)
        -> Result<u64, StoreError>;
}
