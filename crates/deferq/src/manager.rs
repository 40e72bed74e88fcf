//! Task manager: the writer-side interface to the store
//!
//! Scheduling inserts a self-contained row — the retry policy travels with
//! the task, so workers never look configuration up at execution time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::persistence::{StoreError, TaskStore};
use crate::registry::TaskType;
use crate::task::{validate_category, NewTask, TaskParams, TaskStatus, ValidationError};

/// Errors surfaced synchronously to schedule/cancel callers.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// Input rejected before any row was written
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Store operation failed; not retried here, the caller decides
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Schedules new tasks and cancels pending ones.
///
/// # Example
///
/// ```ignore
/// use deferq::{InMemoryTaskStore, TaskManager, TaskParams};
/// use std::sync::Arc;
///
/// let manager = TaskManager::new(Arc::new(InMemoryTaskStore::new()));
/// let id = manager
///     .schedule("email", "send_email", TaskParams::parse(payload)?, chrono::Utc::now())
///     .await?;
/// ```
pub struct TaskManager {
    store: Arc<dyn TaskStore>,
}

impl TaskManager {
    /// Create a manager over an explicitly constructed store handle.
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Insert a new PENDING task and return the store-assigned id.
    ///
    /// The payload was validated when `params` was constructed; the retry
    /// configuration attached to `params` is captured into the row. The
    /// insert is not retried internally.
    #[instrument(skip(self, params))]
    pub async fn schedule(
        &self,
        category: &str,
        task_class: &str,
        params: TaskParams,
        scheduled_time: DateTime<Utc>,
    ) -> Result<Uuid, ScheduleError> {
        validate_category(category)?;

        let id = self
            .store
            .insert(NewTask {
                category: category.to_string(),
                task_class: task_class.to_string(),
                params: params.payload().clone(),
                scheduled_time,
                retry: params.retry_policy().clone(),
            })
            .await?;

        debug!(%id, category, task_class, %scheduled_time, "scheduled task");
        Ok(id)
    }

    /// Typed variant of [`schedule`](Self::schedule) for registered task types.
    pub async fn schedule_as<T: TaskType>(
        &self,
        category: &str,
        params: TaskParams,
        scheduled_time: DateTime<Utc>,
    ) -> Result<Uuid, ScheduleError> {
        self.schedule(category, T::TYPE, params, scheduled_time).await
    }

    /// Atomically transition a task from PENDING to CANCELLED.
    ///
    /// Returns whether the transition happened. A task a poller has already
    /// claimed (or that finished) is left alone and `false` comes back — the
    /// conditional update is what closes the race against the claim.
    #[instrument(skip(self))]
    pub async fn cancel(&self, category: &str, id: Uuid) -> Result<bool, ScheduleError> {
        validate_category(category)?;

        let cancelled = self
            .store
            .update_status(category, id, TaskStatus::Pending, TaskStatus::Cancelled)
            .await?;

        debug!(%id, category, cancelled, "cancel requested");
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryTaskStore;
    use crate::retry::RetryPolicy;
    use std::time::Duration;

    fn manager_with_store() -> (TaskManager, Arc<InMemoryTaskStore>) {
        let store = Arc::new(InMemoryTaskStore::new());
        (TaskManager::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_schedule_inserts_pending_row() {
        let (manager, store) = manager_with_store();
        let params = TaskParams::parse(r#"{"to": "ops@example.com"}"#)
            .unwrap()
            .with_retry_policy(RetryPolicy::exponential(2.0, 3, Duration::from_secs(10)));

        let id = manager
            .schedule("email", "send_email", params, Utc::now())
            .await
            .unwrap();

        let record = store.get("email", id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.task_class, "send_email");
        assert_eq!(record.attempt_count, 0);
        // Policy captured into the row
        assert_eq!(record.max_attempts, 3);
        assert!(record.exponential_backoff);
        assert_eq!(record.max_backoff_ms, 10_000);
    }

    #[tokio::test]
    async fn test_schedule_defaults_to_single_attempt() {
        let (manager, store) = manager_with_store();

        let id = manager
            .schedule("email", "send_email", TaskParams::parse("{}").unwrap(), Utc::now())
            .await
            .unwrap();

        let record = store.get("email", id).await.unwrap();
        assert_eq!(record.max_attempts, 1);
        assert!(!record.exponential_backoff);
    }

    #[tokio::test]
    async fn test_schedule_rejects_bad_category() {
        let (manager, _) = manager_with_store();

        let err = manager
            .schedule("Not Valid", "send_email", TaskParams::parse("{}").unwrap(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::Validation(_)));
    }

    #[tokio::test]
    async fn test_cancel_only_pending() {
        let (manager, store) = manager_with_store();
        let now = Utc::now();

        let id = manager
            .schedule("email", "send_email", TaskParams::parse("{}").unwrap(), now)
            .await
            .unwrap();

        assert!(manager.cancel("email", id).await.unwrap());
        assert_eq!(
            store.get("email", id).await.unwrap().status,
            TaskStatus::Cancelled
        );

        // Cancelling again reports false
        assert!(!manager.cancel("email", id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_loses_to_claim() {
        let (manager, store) = manager_with_store();
        let now = Utc::now();

        let id = manager
            .schedule("email", "send_email", TaskParams::parse("{}").unwrap(), now)
            .await
            .unwrap();

        let claimed = store.claim_due_batch("email", 1, now).await.unwrap();
        assert_eq!(claimed.len(), 1);

        assert!(!manager.cancel("email", id).await.unwrap());
        assert_eq!(
            store.get("email", id).await.unwrap().status,
            TaskStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_cancel_unknown_id_is_false() {
        let (manager, _) = manager_with_store();
        assert!(!manager.cancel("email", Uuid::now_v7()).await.unwrap());
    }
}
