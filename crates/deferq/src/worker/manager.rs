//! Worker lifecycle management
//!
//! Owns one pool per category. Lookups on the category map never block
//! init/destroy of unrelated categories.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use super::pool::{CategoryPool, WorkerConfig};
use crate::clock::{Clock, SystemClock};
use crate::persistence::{StoreError, TaskStore};
use crate::registry::TaskRegistry;
use crate::retry::RetryPolicy;

/// Worker manager errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Store failure during init; schema problems arrive as
    /// [`StoreError::Schema`] and nothing is started
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Starts and stops per-category worker pools.
///
/// # Example
///
/// ```ignore
/// use deferq::{RetryPolicy, TaskRegistry, WorkerConfig, WorkerManager};
/// use std::sync::Arc;
///
/// let mut registry = TaskRegistry::new();
/// registry.register::<SendEmailTask>();
///
/// let workers = WorkerManager::new(store, Arc::new(registry));
/// workers.init(WorkerConfig::new("email"), RetryPolicy::no_retry()).await?;
///
/// // ... later
/// workers.destroy("email").await;
/// ```
pub struct WorkerManager {
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskRegistry>,
    clock: Arc<dyn Clock>,
    pools: DashMap<String, CategoryPool>,
}

impl WorkerManager {
    /// Create a manager over an explicitly constructed store handle.
    pub fn new(store: Arc<dyn TaskStore>, registry: Arc<TaskRegistry>) -> Self {
        Self::with_clock(store, registry, Arc::new(SystemClock))
    }

    /// Create a manager with an injected clock (tests).
    pub fn with_clock(
        store: Arc<dyn TaskStore>,
        registry: Arc<TaskRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            pools: DashMap::new(),
        }
    }

    /// Start a category's pool and poller.
    ///
    /// Idempotent-guarded: a second init for a running category warns and
    /// does nothing. The category's schema is validated before anything
    /// starts, so a broken table fails fast with no partial pool.
    ///
    /// `default_retry` applies only to rows that carry no captured policy;
    /// a task's own stored policy always wins.
    #[instrument(skip(self, config, default_retry), fields(category = %config.category))]
    pub async fn init(
        &self,
        config: WorkerConfig,
        default_retry: RetryPolicy,
    ) -> Result<(), WorkerError> {
        let category = config.category.clone();

        if self.pools.contains_key(&category) {
            warn!(category, "worker already running, init is a no-op");
            return Ok(());
        }

        self.store.validate_schema(&category).await?;

        let pool = CategoryPool::start(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            Arc::clone(&self.clock),
            config,
            default_retry,
        );

        match self.pools.entry(category.clone()) {
            Entry::Occupied(_) => {
                // Lost a concurrent init race; ours never claimed anything
                warn!(category, "worker already running, init is a no-op");
                pool.shutdown_now();
            }
            Entry::Vacant(entry) => {
                entry.insert(pool);
                info!(category, "worker started");
            }
        }

        Ok(())
    }

    /// Stop a category's pool: intake stops immediately, in-flight work is
    /// drained up to the configured bound, then force-cancelled.
    ///
    /// Unknown categories are a no-op; calling twice is safe.
    #[instrument(skip(self))]
    pub async fn destroy(&self, category: &str) {
        match self.pools.remove(category) {
            Some((_, pool)) => {
                info!(category, "stopping worker");
                pool.shutdown().await;
            }
            None => {
                debug!(category, "destroy for unknown category, nothing to do");
            }
        }
    }

    /// Stop every category's pool (host-process shutdown path).
    pub async fn shutdown(&self) {
        let categories: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        for category in categories {
            self.destroy(&category).await;
        }
    }

    /// Whether a category currently has a running pool.
    pub fn is_running(&self, category: &str) -> bool {
        self.pools.contains_key(category)
    }

    /// Currently running categories.
    pub fn categories(&self) -> Vec<String> {
        self.pools.iter().map(|e| e.key().clone()).collect()
    }
}
