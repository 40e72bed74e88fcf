//! Task polling
//!
//! One single-threaded poller per category ticks on a fixed period, claims a
//! bounded batch of due tasks, and hands them to the category's pool.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::clock::Clock;
use crate::persistence::{StoreError, TaskStore};
use crate::retry::duration_millis;
use crate::task::TaskRecord;

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Fixed poll period
    #[serde(with = "duration_millis")]
    pub interval: Duration,

    /// Maximum tasks to claim per tick
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

impl PollerConfig {
    /// Create a new poller configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the poll period
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the claim batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    /// Store error; the tick is skipped and the next one reconciles
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Claims due tasks for one category on a fixed tick.
pub struct TaskPoller {
    store: Arc<dyn TaskStore>,
    category: String,
    config: PollerConfig,
    clock: Arc<dyn Clock>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskPoller {
    /// Create a new task poller
    pub fn new(
        store: Arc<dyn TaskStore>,
        category: String,
        config: PollerConfig,
        clock: Arc<dyn Clock>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            category,
            config,
            clock,
            shutdown_rx,
        }
    }

    /// Claim up to one batch of due tasks.
    ///
    /// Each returned record has already been transitioned to PROCESSING by
    /// the store's atomic claim, so it belongs to this poller exclusively.
    pub async fn poll(&mut self) -> Result<Vec<TaskRecord>, PollerError> {
        if *self.shutdown_rx.borrow() {
            debug!(category = %self.category, "poller shutdown requested");
            return Ok(vec![]);
        }

        let tasks = self
            .store
            .claim_due_batch(&self.category, self.config.batch_size, self.clock.now())
            .await?;

        if !tasks.is_empty() {
            debug!(category = %self.category, count = tasks.len(), "claimed tasks");
        }
        Ok(tasks)
    }

    /// Wait out the poll period.
    ///
    /// Returns true if shutdown was signaled during the wait.
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.config.interval) => false,
            _ = shutdown_rx.changed() => {
                debug!(category = %self.category, "shutdown signal received during wait");
                true
            }
        }
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::InMemoryTaskStore;
    use crate::retry::RetryPolicy;
    use crate::task::NewTask;

    #[test]
    fn test_default_config() {
        let config = PollerConfig::default();
        assert_eq!(config.interval, Duration::from_secs(1));
        assert_eq!(config.batch_size, 100);
    }

    #[test]
    fn test_config_builder() {
        let config = PollerConfig::new()
            .with_interval(Duration::from_millis(250))
            .with_batch_size(0);

        assert_eq!(config.interval, Duration::from_millis(250));
        // Batch size is clamped to at least one
        assert_eq!(config.batch_size, 1);
    }

    #[tokio::test]
    async fn test_poll_uses_injected_clock() {
        let store = Arc::new(InMemoryTaskStore::new());
        let clock = Arc::new(ManualClock::new());
        let (_tx, rx) = watch::channel(false);

        store
            .insert(NewTask {
                category: "email".into(),
                task_class: "send_email".into(),
                params: serde_json::json!({}),
                scheduled_time: clock.now() + chrono::TimeDelta::hours(1),
                retry: RetryPolicy::no_retry(),
            })
            .await
            .unwrap();

        let mut poller = TaskPoller::new(
            store.clone(),
            "email".into(),
            PollerConfig::default(),
            Arc::clone(&clock) as Arc<dyn Clock>,
            rx,
        );

        assert!(poller.poll().await.unwrap().is_empty());

        clock.advance(Duration::from_secs(3601));
        assert_eq!(poller.poll().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_poll_after_shutdown_claims_nothing() {
        let store = Arc::new(InMemoryTaskStore::new());
        let clock = Arc::new(ManualClock::new());
        let (tx, rx) = watch::channel(false);

        store
            .insert(NewTask {
                category: "email".into(),
                task_class: "send_email".into(),
                params: serde_json::json!({}),
                scheduled_time: clock.now(),
                retry: RetryPolicy::no_retry(),
            })
            .await
            .unwrap();

        let mut poller = TaskPoller::new(
            store,
            "email".into(),
            PollerConfig::default(),
            Arc::clone(&clock) as Arc<dyn Clock>,
            rx,
        );

        tx.send(true).unwrap();
        assert!(poller.is_shutdown());
        assert!(poller.poll().await.unwrap().is_empty());
    }
}
