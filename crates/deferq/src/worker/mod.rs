//! Worker pools: one poller plus one bounded executor per category
//!
//! This module provides:
//! - [`WorkerManager`] - starts/stops per-category pools
//! - [`WorkerConfig`] - per-category pool configuration
//! - [`PollerConfig`] - claim cadence and batch size
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     WorkerManager                         │
//! │            (category → pool, init/destroy)                │
//! │                                                           │
//! │  per category:                                            │
//! │  ┌────────────┐   claim    ┌──────────────────────────┐  │
//! │  │ TaskPoller │──────────▶ │ Executor (semaphore N)   │  │
//! │  │ (1s tick)  │            │ [task] [task] ... [task] │  │
//! │  └────────────┘            └───────────┬──────────────┘  │
//! │  ┌─────────────────┐                   │ outcome write   │
//! │  │ Stale reclaimer │                   ▼                 │
//! │  │ (30s sweep)     │        COMPLETED / PENDING / FAILED │
//! │  └─────────────────┘                                     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use deferq::{RetryPolicy, TaskRegistry, WorkerConfig, WorkerManager};
//!
//! let workers = WorkerManager::new(store, registry);
//! workers
//!     .init(
//!         WorkerConfig::new("email").with_max_concurrency(8),
//!         RetryPolicy::no_retry(),
//!     )
//!     .await?;
//!
//! // Graceful shutdown
//! workers.destroy("email").await;
//! ```

mod manager;
mod poller;
mod pool;

pub use manager::{WorkerError, WorkerManager};
pub use poller::{PollerConfig, PollerError, TaskPoller};
pub use pool::WorkerConfig;
