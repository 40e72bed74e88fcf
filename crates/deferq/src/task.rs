//! Task data model
//!
//! A task row lives in exactly one category table and moves through the
//! status state machine:
//!
//! ```text
//! PENDING ──claim──▶ PROCESSING ──▶ COMPLETED
//!    ▲                    │
//!    │ retry              ├──▶ PENDING (attempt_count + 1, next_attempt_time set)
//!    │                    └──▶ FAILED  (attempts exhausted)
//!    └── CANCELLED (only from PENDING, via TaskManager::cancel)
//! ```
//!
//! `PROCESSING` is transient: exactly one worker holds the task while it is
//! in that state, and the outcome write moves it out again.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::retry::RetryPolicy;

/// Validation failures raised before anything is written to the store.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// Task payload is not well-formed JSON
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Category name unusable as a table partition
    #[error("invalid category name: {0:?} (expected lowercase alphanumeric/underscore)")]
    Category(String),
}

/// Durable status of a task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting to become due (initial state, and the state a retry returns to)
    Pending,

    /// Claimed by exactly one worker, execution in flight
    Processing,

    /// Terminal: executed successfully
    Completed,

    /// Terminal: attempts exhausted
    Failed,

    /// Terminal: cancelled before it was ever claimed
    Cancelled,
}

impl TaskStatus {
    /// Whether no further transition can occur.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Processing => write!(f, "PROCESSING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Validated task parameters: the opaque JSON payload handed to the
/// executable, plus the retry configuration captured at schedule time.
///
/// # Example
///
/// ```
/// use deferq::{RetryPolicy, TaskParams};
/// use std::time::Duration;
///
/// let params = TaskParams::parse(r#"{"to": "ops@example.com"}"#)
///     .unwrap()
///     .with_retry_policy(RetryPolicy::fixed(Duration::from_secs(5), 3));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TaskParams {
    payload: serde_json::Value,
    retry: RetryPolicy,
}

impl TaskParams {
    /// Parse a raw JSON string; malformed input is a [`ValidationError`].
    pub fn parse(json: &str) -> Result<Self, ValidationError> {
        let payload = serde_json::from_str(json)?;
        Ok(Self {
            payload,
            retry: RetryPolicy::no_retry(),
        })
    }

    /// Wrap an already-structured payload.
    pub fn from_value(payload: serde_json::Value) -> Self {
        Self {
            payload,
            retry: RetryPolicy::no_retry(),
        }
    }

    /// Attach a retry policy (default: single attempt, no backoff).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Deserialize the payload into a typed value.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, ValidationError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Definition of a task to be inserted (pre-id).
#[derive(Debug, Clone)]
pub struct NewTask {
    pub category: String,
    pub task_class: String,
    pub params: serde_json::Value,
    pub scheduled_time: DateTime<Utc>,
    pub retry: RetryPolicy,
}

/// Immutable snapshot of a persisted task, read for execution.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: Uuid,
    pub category: String,
    pub task_class: String,
    pub params: serde_json::Value,
    pub status: TaskStatus,
    pub scheduled_time: DateTime<Utc>,
    pub next_attempt_time: Option<DateTime<Utc>>,
    pub max_attempts: u32,
    pub exponential_backoff: bool,
    pub backoff_base: f64,
    pub max_backoff_ms: u64,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_since: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Reassemble the retry policy captured in this row.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            exponential: self.exponential_backoff,
            base: self.backoff_base,
            max_attempts: self.max_attempts,
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    /// The params as handed to the executable.
    pub fn task_params(&self) -> TaskParams {
        TaskParams::from_value(self.params.clone()).with_retry_policy(self.retry_policy())
    }

    /// Whether this row is due at `now`.
    ///
    /// `next_attempt_time`, once set by a retry, supersedes the original
    /// `scheduled_time` — otherwise a retried row whose schedule has already
    /// passed would be due again immediately and the backoff delay would
    /// never be observed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_time.unwrap_or(self.scheduled_time) <= now
    }
}

/// Check a category name is safe to use as a table-name suffix.
///
/// Category names become SQL identifiers (`deferred_<category>`), so the
/// alphabet is restricted rather than quoted.
pub fn validate_category(category: &str) -> Result<(), ValidationError> {
    let ok = !category.is_empty()
        && category.len() <= 50
        && category
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !category.starts_with(|c: char| c.is_ascii_digit());

    if ok {
        Ok(())
    } else {
        Err(ValidationError::Category(category.to_string()))
    }
}
