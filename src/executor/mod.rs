//! Job executors: the unit of work a workflow runs.
//!
//! The engine only sees `execute(unit, context) -> output | failure`. Variants
//! are adapters chosen when the workflow is defined: a spawned command (the
//! containerized task), an HTTP function invocation, or an in-process closure.

pub mod command;
pub mod function;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{RunId, WorkUnit};

pub use command::CommandExecutor;
pub use function::FunctionExecutor;

/// Per-attempt information handed to the executor.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub workflow: String,
    pub run_id: RunId,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Upper bound for this attempt, enforced by the executor.
    pub timeout: Option<Duration>,
}

/// A failed attempt. Every variant is retried by the engine.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("{0}")]
    Failed(String),

    #[error("attempt timed out after {0:?}")]
    TimedOut(Duration),

    #[error("could not start task: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("function invocation failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl ExecutionError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Short label for logs and metrics (e.g. "command", "function").
    fn kind(&self) -> &'static str;

    async fn execute(
        &self,
        unit: &WorkUnit,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ExecutionError>;
}

type BoxedJob = Box<
    dyn Fn(
            WorkUnit,
            ExecutionContext,
        ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, ExecutionError>> + Send>>
        + Send
        + Sync,
>;

/// Executor backed by an async closure.
pub struct FnExecutor {
    job: BoxedJob,
}

impl FnExecutor {
    pub fn new<F, Fut>(job: F) -> Self
    where
        F: Fn(WorkUnit, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, ExecutionError>> + Send + 'static,
    {
        Self {
            job: Box::new(move |unit, ctx| Box::pin(job(unit, ctx))),
        }
    }
}

#[async_trait]
impl JobExecutor for FnExecutor {
    fn kind(&self) -> &'static str {
        "fn"
    }

    async fn execute(
        &self,
        unit: &WorkUnit,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ExecutionError> {
        let fut = (self.job)(unit.clone(), ctx.clone());
        match ctx.timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| ExecutionError::TimedOut(limit))?,
            None => fut.await,
        }
    }
}
