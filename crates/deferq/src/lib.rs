//! # Deferq
//!
//! A PostgreSQL-backed, category-partitioned deferred-task scheduler.
//!
//! Callers enqueue typed work items with a target execution time and a
//! per-item retry policy; per-category worker pools poll the durable store,
//! claim due items exclusively, execute them, and record the outcome,
//! retrying with fixed or exponential backoff up to the attempt limit.
//!
//! ## Guarantees
//!
//! - **At most one executor per task**: claiming is a single atomic
//!   conditional update (SKIP LOCKED), never a read followed by a write
//! - **No lost tasks**: claimed work that finds no free execution slot runs
//!   inline on the poller instead of being dropped
//! - **Bounded retries**: each task carries its own retry policy, captured
//!   at schedule time; attempts never exceed `max_attempts`
//! - **Category isolation**: one table, one poller, and one bounded pool per
//!   category — a slow category cannot starve another
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaskManager                           │
//! │              (schedule → PENDING row, cancel)                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         TaskStore                            │
//! │        (PostgreSQL: one deferred_<category> table each)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerManager                          │
//! │   (per category: poller claims due batch → pool executes     │
//! │    → one atomic outcome write: COMPLETED / retry / FAILED)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use deferq::prelude::*;
//! use std::sync::Arc;
//!
//! #[derive(Default)]
//! struct SendEmailTask;
//!
//! #[async_trait::async_trait]
//! impl Task for SendEmailTask {
//!     async fn execute(&self, params: &TaskParams) -> anyhow::Result<()> {
//!         let email: Email = params.payload_as()?;
//!         // send it...
//!         Ok(())
//!     }
//! }
//!
//! impl TaskType for SendEmailTask {
//!     const TYPE: &'static str = "send_email";
//! }
//!
//! let store = Arc::new(PostgresTaskStore::new(pool));
//! let mut registry = TaskRegistry::new();
//! registry.register::<SendEmailTask>();
//!
//! let tasks = TaskManager::new(store.clone());
//! let workers = WorkerManager::new(store, Arc::new(registry));
//! workers.init(WorkerConfig::new("email"), RetryPolicy::no_retry()).await?;
//!
//! let params = TaskParams::parse(r#"{"to": "ops@example.com"}"#)?
//!     .with_retry_policy(RetryPolicy::exponential(2.0, 5, Duration::from_secs(60)));
//! tasks.schedule_as::<SendEmailTask>("email", params, Utc::now()).await?;
//! ```

pub mod clock;
pub mod manager;
pub mod persistence;
pub mod registry;
pub mod retry;
pub mod task;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::manager::{ScheduleError, TaskManager};
    pub use crate::persistence::{
        InMemoryTaskStore, PostgresTaskStore, StoreError, TaskOutcome, TaskStore,
    };
    pub use crate::registry::{RegistryError, Task, TaskRegistry, TaskType};
    pub use crate::retry::RetryPolicy;
    pub use crate::task::{TaskParams, TaskRecord, TaskStatus, ValidationError};
    pub use crate::worker::{PollerConfig, WorkerConfig, WorkerError, WorkerManager};
}

// Re-export key types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use manager::{ScheduleError, TaskManager};
pub use persistence::{InMemoryTaskStore, PostgresTaskStore, StoreError, TaskOutcome, TaskStore};
pub use registry::{RegistryError, Task, TaskRegistry, TaskType};
pub use retry::RetryPolicy;
pub use task::{NewTask, TaskParams, TaskRecord, TaskStatus, ValidationError};
pub use worker::{PollerConfig, PollerError, WorkerConfig, WorkerError, WorkerManager};
