//! Failure notification.
//!
//! Delivery is best effort: the engine logs a notifier error and still moves
//! the run to `Failed`.

pub mod topic;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::Result;
use crate::model::{RunId, WorkflowRun};

pub use topic::{MemoryTopic, TopicNotifier, TopicPublisher};

/// Fixed text every failure notification carries.
pub const FAILURE_MESSAGE: &str = "task has failed.";

/// What an operator receives when a run exhausts its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureNotice {
    pub workflow: String,
    pub run_id: RunId,
    pub key: Option<String>,
    pub message: String,
    /// Last captured error detail.
    pub error: Option<String>,
    pub attempts: u32,
}

impl FailureNotice {
    pub fn for_run(run: &WorkflowRun) -> Self {
        Self {
            workflow: run.workflow.clone(),
            run_id: run.id,
            key: run.key.clone(),
            message: FAILURE_MESSAGE.to_string(),
            error: run
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .or_else(|| run.last_attempt_error().map(str::to_string)),
            attempts: run.attempts.len() as u32,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &FailureNotice) -> Result<()>;
}

/// Notifier that only logs. Used when a workflow has no notification target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notice: &FailureNotice) -> Result<()> {
        error!(
            workflow = %notice.workflow,
            run_id = %notice.run_id,
            key = notice.key.as_deref().unwrap_or("-"),
            attempts = notice.attempts,
            error = notice.error.as_deref().unwrap_or("-"),
            "{}",
            notice.message
        );
        Ok(())
    }
}
