//! In-memory implementation of TaskStore for testing
//!
//! All mutation happens under a single write lock per call, which gives the
//! same effective semantics as the SQL implementation's per-row conditional
//! updates: a claim and a cancel can interleave but never both win.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::{StoreError, TaskOutcome, TaskStore};
use crate::task::{validate_category, NewTask, TaskRecord, TaskStatus};

/// In-memory implementation of [`TaskStore`].
///
/// Primarily for testing; category tables spring into existence on first
/// insert, and `validate_schema` always passes for a valid category name.
///
/// # Example
///
/// ```
/// use deferq::InMemoryTaskStore;
///
/// let store = InMemoryTaskStore::new();
/// ```
pub struct InMemoryTaskStore {
    tables: RwLock<HashMap<String, HashMap<Uuid, TaskRecord>>>,
}

impl InMemoryTaskStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Number of rows in a category with the given status (test helper).
    pub fn count(&self, category: &str, status: TaskStatus) -> usize {
        self.tables
            .read()
            .get(category)
            .map(|t| t.values().filter(|r| r.status == status).count())
            .unwrap_or(0)
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.tables.write().clear();
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: NewTask) -> Result<Uuid, StoreError> {
        validate_category(&task.category)
            .map_err(|_| StoreError::InvalidCategory(task.category.clone()))?;

        let id = Uuid::now_v7();
        let record = TaskRecord {
            id,
            category: task.category.clone(),
            task_class: task.task_class,
            params: task.params,
            status: TaskStatus::Pending,
            scheduled_time: task.scheduled_time,
            next_attempt_time: None,
            max_attempts: task.retry.max_attempts,
            exponential_backoff: task.retry.exponential,
            backoff_base: task.retry.base,
            max_backoff_ms: task.retry.max_backoff.as_millis() as u64,
            attempt_count: 0,
            created_at: Utc::now(),
            completed_at: None,
            processing_since: None,
        };

        self.tables
            .write()
            .entry(task.category)
            .or_default()
            .insert(id, record);
        Ok(id)
    }

    async fn update_status(
        &self,
        category: &str,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write();
        let Some(record) = tables.get_mut(category).and_then(|t| t.get_mut(&id)) else {
            return Ok(false);
        };

        if record.status != from {
            return Ok(false);
        }

        record.status = to;
        Ok(true)
    }

    async fn claim_due_batch(
        &self,
        category: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let mut tables = self.tables.write();
        let Some(table) = tables.get_mut(category) else {
            return Ok(vec![]);
        };

        let mut due: Vec<Uuid> = table
            .values()
            .filter(|r| r.status == TaskStatus::Pending && r.is_due(now))
            .map(|r| r.id)
            .collect();
        due.sort_by_key(|id| table[id].scheduled_time);
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(record) = table.get_mut(&id) {
                record.status = TaskStatus::Processing;
                record.processing_since = Some(now);
                claimed.push(record.clone());
            }
        }

        Ok(claimed)
    }

    async fn record_outcome(
        &self,
        category: &str,
        id: Uuid,
        outcome: TaskOutcome,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let record = tables
            .get_mut(category)
            .and_then(|t| t.get_mut(&id))
            .ok_or(StoreError::TaskNotFound(id))?;

        if record.status != TaskStatus::Processing {
            return Err(StoreError::Conflict {
                id,
                expected: TaskStatus::Processing,
            });
        }

        record.status = outcome.status();
        record.attempt_count = outcome.attempt_count();
        record.processing_since = None;
        match outcome {
            TaskOutcome::Completed { completed_at, .. } => {
                record.completed_at = Some(completed_at);
            }
            TaskOutcome::Failed { .. } => {}
            TaskOutcome::Retry {
                next_attempt_time, ..
            } => {
                record.next_attempt_time = Some(next_attempt_time);
            }
        }

        Ok(())
    }

    async fn get(&self, category: &str, id: Uuid) -> Result<TaskRecord, StoreError> {
        self.tables
            .read()
            .get(category)
            .and_then(|t| t.get(&id))
            .cloned()
            .ok_or(StoreError::TaskNotFound(id))
    }

    async fn validate_schema(&self, category: &str) -> Result<(), StoreError> {
        validate_category(category).map_err(|_| StoreError::InvalidCategory(category.to_string()))
    }

    async fn reclaim_stale(
        &self,
        category: &str,
        visibility_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let cutoff = chrono::TimeDelta::from_std(visibility_timeout)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let mut tables = self.tables.write();
        let Some(table) = tables.get_mut(category) else {
            return Ok(vec![]);
        };

        let mut reclaimed = vec![];
        for record in table.values_mut() {
            if record.status == TaskStatus::Processing
                && record.processing_since.is_some_and(|t| t < cutoff)
            {
                record.status = TaskStatus::Pending;
                record.processing_since = None;
                reclaimed.push(record.id);
            }
        }

        Ok(reclaimed)
    }

    async fn count_by_status(
        &self,
        category: &str,
        status: TaskStatus,
    ) -> Result<u64, StoreError> {
        Ok(self.count(category, status) as u64)
    }
}
