//! Sample task implementations
//!
//! Three executables covering the shapes task authors run into: a payload-
//! driven task that can fail on bad input (`send_email`), a blocking one
//! (`long_running`), and one that always fails (`always_fail`, for exercising
//! the retry path). Register them all with [`register_builtin`].

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use deferq::{Task, TaskParams, TaskRegistry, TaskType};

/// Payload for [`SendEmailTask`].
#[derive(Debug, Deserialize)]
pub struct EmailPayload {
    pub to: String,
    pub subject: String,
}

/// Sends an email described by the payload.
///
/// Missing or malformed payload fields are an attempt failure, so a task
/// scheduled with bad params fails without retry-looping forever only if its
/// policy says so — the engine treats it like any other error.
#[derive(Debug, Default)]
pub struct SendEmailTask;

#[async_trait]
impl Task for SendEmailTask {
    async fn execute(&self, params: &TaskParams) -> anyhow::Result<()> {
        let email: EmailPayload = params.payload_as()?;
        // Delivery would go through the mail gateway here
        info!(to = %email.to, subject = %email.subject, "sending email");
        Ok(())
    }
}

impl TaskType for SendEmailTask {
    const TYPE: &'static str = "send_email";
}

/// Occupies an execution slot for `duration_ms` (default 1000).
#[derive(Debug, Default)]
pub struct LongRunningTask;

#[derive(Debug, Deserialize)]
struct LongRunningPayload {
    #[serde(default = "default_duration_ms")]
    duration_ms: u64,
}

fn default_duration_ms() -> u64 {
    1000
}

#[async_trait]
impl Task for LongRunningTask {
    async fn execute(&self, params: &TaskParams) -> anyhow::Result<()> {
        let payload: LongRunningPayload = params.payload_as().unwrap_or(LongRunningPayload {
            duration_ms: default_duration_ms(),
        });

        info!(duration_ms = payload.duration_ms, "long-running task started");
        tokio::time::sleep(std::time::Duration::from_millis(payload.duration_ms)).await;
        info!(duration_ms = payload.duration_ms, "long-running task finished");
        Ok(())
    }
}

impl TaskType for LongRunningTask {
    const TYPE: &'static str = "long_running";
}

/// Fails every attempt; exists to exercise backoff and exhaustion.
#[derive(Debug, Default)]
pub struct AlwaysFailingTask;

#[async_trait]
impl Task for AlwaysFailingTask {
    async fn execute(&self, _params: &TaskParams) -> anyhow::Result<()> {
        anyhow::bail!("this task always fails")
    }
}

impl TaskType for AlwaysFailingTask {
    const TYPE: &'static str = "always_fail";
}

/// Register every sample task type.
pub fn register_builtin(registry: &mut TaskRegistry) {
    registry.register::<SendEmailTask>();
    registry.register::<LongRunningTask>();
    registry.register::<AlwaysFailingTask>();
}
