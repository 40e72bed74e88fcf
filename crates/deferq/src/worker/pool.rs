//! Per-category worker pool
//!
//! Runs the claim → execute → finalize pipeline for one category:
//! a poller claims due batches, a semaphore bounds concurrent executions,
//! and every execution ends in exactly one atomic outcome write.
//!
//! Backpressure rule: a claimed task that finds no free execution slot runs
//! inline on the poller instead — claimed work is never dropped or rejected,
//! the poller just stops claiming until it catches up.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::poller::{PollerConfig, TaskPoller};
use crate::clock::Clock;
use crate::persistence::{TaskOutcome, TaskStore};
use crate::registry::TaskRegistry;
use crate::retry::{duration_millis, RetryPolicy};
use crate::task::TaskRecord;

/// Configuration for one category's worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Category this pool serves
    pub category: String,

    /// Maximum concurrent task executions
    pub max_concurrency: usize,

    /// Poller configuration
    pub poller: PollerConfig,

    /// Graceful drain bound before in-flight work is force-cancelled
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// How often to sweep for stale PROCESSING rows
    #[serde(with = "duration_millis")]
    pub reclaim_interval: Duration,

    /// Age past which a PROCESSING row is considered abandoned.
    ///
    /// Must exceed the longest expected task execution: the sweep requeues
    /// anything older, and a requeued task that is still secretly running
    /// breaks the one-executor guarantee.
    #[serde(with = "duration_millis")]
    pub visibility_timeout: Duration,
}

impl WorkerConfig {
    /// Create a configuration for a category with defaults.
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            max_concurrency: 4,
            poller: PollerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
            reclaim_interval: Duration::from_secs(30),
            visibility_timeout: Duration::from_secs(60),
        }
    }

    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set poller configuration
    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the stale-row visibility timeout
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Set the stale-sweep interval
    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }
}

/// Everything an execution needs, shared across the pool's tasks.
pub(crate) struct ExecutionContext {
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) registry: Arc<TaskRegistry>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) default_retry: RetryPolicy,
}

impl ExecutionContext {
    /// The retry policy governing a record: the row's own captured policy,
    /// or the category default for rows that carry none.
    fn policy_for(&self, record: &TaskRecord) -> RetryPolicy {
        if record.max_attempts == 0 {
            self.default_retry.clone()
        } else {
            record.retry_policy()
        }
    }

    /// Compute the outcome write for a finished attempt.
    ///
    /// The attempt convention lives here and nowhere else: the attempt that
    /// just ran is `attempt_count + 1`, and that number is compared against
    /// `max_attempts` before anything is written.
    fn outcome_for(&self, record: &TaskRecord, failed: bool) -> TaskOutcome {
        let now = self.clock.now();
        let next_attempt = record.attempt_count + 1;

        if !failed {
            return TaskOutcome::Completed {
                attempt_count: next_attempt,
                completed_at: now,
            };
        }

        let policy = self.policy_for(record);
        if next_attempt >= policy.max_attempts {
            TaskOutcome::Failed {
                attempt_count: next_attempt,
            }
        } else {
            let delay = policy.delay_for_attempt(next_attempt);
            TaskOutcome::Retry {
                attempt_count: next_attempt,
                // Saturate rather than panic on absurd delays
                next_attempt_time: chrono::TimeDelta::from_std(delay)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC),
            }
        }
    }

    /// Run one claimed task to its outcome write.
    ///
    /// Every failure mode — unknown task type, task-body error — is caught
    /// here and fed into the retry/fail transition; nothing propagates out
    /// to the poller or the pool.
    pub(crate) async fn execute(&self, record: TaskRecord) {
        let error = match self.registry.resolve(&record.task_class) {
            Ok(task) => match task.execute(&record.task_params()).await {
                Ok(()) => None,
                Err(e) => Some(e.to_string()),
            },
            // Unresolvable task types consume an attempt like any failure
            Err(e) => Some(e.to_string()),
        };

        if let Some(ref e) = error {
            warn!(
                task_id = %record.id,
                category = %record.category,
                task_class = %record.task_class,
                attempt = record.attempt_count + 1,
                "task attempt failed: {e}"
            );
        }

        let outcome = self.outcome_for(&record, error.is_some());
        if let Err(e) = self
            .store
            .record_outcome(&record.category, record.id, outcome)
            .await
        {
            // The row stays PROCESSING; only the stale sweep can recover it
            error!(task_id = %record.id, category = %record.category, "failed to record outcome: {e}");
        }
    }
}

/// One category's running pool: poller, executor slots, stale sweep.
pub(crate) struct CategoryPool {
    config: WorkerConfig,
    shutdown_tx: watch::Sender<bool>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    poll_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    reclaim_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CategoryPool {
    /// Start the poll and reclaim loops for a category.
    pub(crate) fn start(
        store: Arc<dyn TaskStore>,
        registry: Arc<TaskRegistry>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
        default_retry: RetryPolicy,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let ctx = Arc::new(ExecutionContext {
            store: Arc::clone(&store),
            registry,
            clock: Arc::clone(&clock),
            default_retry,
        });

        let poll_handle = Self::start_poll_loop(
            Arc::clone(&ctx),
            config.clone(),
            shutdown_rx.clone(),
            cancel.clone(),
            tracker.clone(),
        );
        let reclaim_handle = Self::start_reclaim_loop(store, clock, config.clone(), shutdown_rx);

        Self {
            config,
            shutdown_tx,
            cancel,
            tracker,
            poll_handle: std::sync::Mutex::new(Some(poll_handle)),
            reclaim_handle: std::sync::Mutex::new(Some(reclaim_handle)),
        }
    }

    fn start_poll_loop(
        ctx: Arc<ExecutionContext>,
        config: WorkerConfig,
        shutdown_rx: watch::Receiver<bool>,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) -> JoinHandle<()> {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency));

        tokio::spawn(async move {
            let mut poller = TaskPoller::new(
                Arc::clone(&ctx.store),
                config.category.clone(),
                config.poller.clone(),
                Arc::clone(&ctx.clock),
                shutdown_rx,
            );

            loop {
                if poller.is_shutdown() {
                    break;
                }

                match poller.poll().await {
                    Ok(tasks) => {
                        for record in tasks {
                            match Arc::clone(&semaphore).try_acquire_owned() {
                                Ok(permit) => {
                                    let ctx = Arc::clone(&ctx);
                                    let cancel = cancel.clone();
                                    let task_id = record.id;
                                    tracker.spawn(async move {
                                        tokio::select! {
                                            _ = cancel.cancelled() => {
                                                warn!(%task_id, "execution abandoned by forced shutdown");
                                            }
                                            _ = ctx.execute(record) => {}
                                        }
                                        drop(permit);
                                    });
                                }
                                Err(_) => {
                                    // All slots busy: run on the poller itself
                                    // rather than drop a claimed task
                                    ctx.execute(record).await;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!(category = %config.category, "poll tick failed, skipping: {e}");
                    }
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!(category = %config.category, "poll loop exited");
        })
    }

    fn start_reclaim_loop(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.reclaim_interval);
            ticker.tick().await; // first tick fires immediately; skip it

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store
                            .reclaim_stale(&config.category, config.visibility_timeout, clock.now())
                            .await
                        {
                            Ok(ids) if !ids.is_empty() => {
                                info!(category = %config.category, count = ids.len(), "requeued stale tasks");
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!(category = %config.category, "stale task reclamation failed: {e}");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }

            debug!(category = %config.category, "reclaim loop exited");
        })
    }

    /// Graceful shutdown: stop intake, drain in-flight work up to the
    /// configured bound, then force-cancel whatever remains.
    pub(crate) async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let loops = [
            self.poll_handle.lock().unwrap().take(),
            self.reclaim_handle.lock().unwrap().take(),
        ];
        for handle in loops.into_iter().flatten() {
            if let Err(e) = handle.await {
                error!(category = %self.config.category, "worker loop panicked: {e}");
            }
        }

        self.tracker.close();
        if tokio::time::timeout(self.config.shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                category = %self.config.category,
                remaining = self.tracker.len(),
                "graceful drain timed out, force-cancelling in-flight tasks"
            );
            self.cancel.cancel();
            self.tracker.wait().await;
        }

        info!(category = %self.config.category, "worker pool stopped");
    }

    /// Tear down a pool that lost the init race before it did any work.
    pub(crate) fn shutdown_now(&self) {
        let _ = self.shutdown_tx.send(true);
        self.cancel.cancel();
        for handle in [
            self.poll_handle.lock().unwrap().take(),
            self.reclaim_handle.lock().unwrap().take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::InMemoryTaskStore;
    use crate::task::TaskStatus;
    use chrono::Utc;
    use uuid::Uuid;

    fn record_with(attempt_count: u32, max_attempts: u32) -> TaskRecord {
        TaskRecord {
            id: Uuid::now_v7(),
            category: "email".into(),
            task_class: "send_email".into(),
            params: serde_json::json!({}),
            status: TaskStatus::Processing,
            scheduled_time: Utc::now(),
            next_attempt_time: None,
            max_attempts,
            exponential_backoff: true,
            backoff_base: 2.0,
            max_backoff_ms: 10_000,
            attempt_count,
            created_at: Utc::now(),
            completed_at: None,
            processing_since: Some(Utc::now()),
        }
    }

    fn test_ctx(clock: Arc<ManualClock>) -> ExecutionContext {
        ExecutionContext {
            store: Arc::new(InMemoryTaskStore::new()),
            registry: Arc::new(TaskRegistry::new()),
            clock,
            default_retry: RetryPolicy::fixed(Duration::from_secs(7), 2),
        }
    }

    #[test]
    fn test_config_defaults_and_builders() {
        let config = WorkerConfig::new("email")
            .with_max_concurrency(0)
            .with_shutdown_timeout(Duration::from_secs(5))
            .with_visibility_timeout(Duration::from_secs(120));

        assert_eq!(config.category, "email");
        // Concurrency is clamped to at least one slot
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.visibility_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_outcome_success_increments_attempts() {
        let clock = Arc::new(ManualClock::new());
        let ctx = test_ctx(Arc::clone(&clock));

        let outcome = ctx.outcome_for(&record_with(0, 3), false);
        assert_eq!(
            outcome,
            TaskOutcome::Completed {
                attempt_count: 1,
                completed_at: clock.now(),
            }
        );
    }

    #[test]
    fn test_outcome_failure_with_attempts_left_schedules_retry() {
        let clock = Arc::new(ManualClock::new());
        let ctx = test_ctx(Arc::clone(&clock));

        // First attempt of three failed: retry after base^1 * 1s = 2s
        let outcome = ctx.outcome_for(&record_with(0, 3), true);
        assert_eq!(
            outcome,
            TaskOutcome::Retry {
                attempt_count: 1,
                next_attempt_time: clock.now() + chrono::TimeDelta::seconds(2),
            }
        );
    }

    #[test]
    fn test_outcome_exhaustion_fails_terminally() {
        let clock = Arc::new(ManualClock::new());
        let ctx = test_ctx(Arc::clone(&clock));

        // Third attempt of three failed: no fourth attempt is ever written
        let outcome = ctx.outcome_for(&record_with(2, 3), true);
        assert_eq!(outcome, TaskOutcome::Failed { attempt_count: 3 });
    }

    #[test]
    fn test_outcome_single_attempt_fails_immediately() {
        let clock = Arc::new(ManualClock::new());
        let ctx = test_ctx(Arc::clone(&clock));

        let outcome = ctx.outcome_for(&record_with(0, 1), true);
        assert_eq!(outcome, TaskOutcome::Failed { attempt_count: 1 });
    }

    #[test]
    fn test_default_policy_covers_policyless_rows() {
        let clock = Arc::new(ManualClock::new());
        let ctx = test_ctx(Arc::clone(&clock));

        // max_attempts == 0 means the row carries no captured policy; the
        // category default (2 attempts, fixed 7s) governs instead
        let outcome = ctx.outcome_for(&record_with(0, 0), true);
        assert_eq!(
            outcome,
            TaskOutcome::Retry {
                attempt_count: 1,
                next_attempt_time: clock.now() + chrono::TimeDelta::seconds(7),
            }
        );

        let outcome = ctx.outcome_for(&record_with(1, 0), true);
        assert_eq!(outcome, TaskOutcome::Failed { attempt_count: 2 });
    }
}
