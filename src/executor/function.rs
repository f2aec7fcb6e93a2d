//! Function executor: invokes an HTTP function endpoint per attempt.
//!
//! The payload is POSTed as JSON and the response body is the result
//! ("payload response only"). Any non-2xx status is a failed attempt.

use async_trait::async_trait;
use tracing::debug;

use super::{ExecutionContext, ExecutionError, JobExecutor};
use crate::model::WorkUnit;

#[derive(Debug, Clone)]
pub struct FunctionExecutor {
    client: reqwest::Client,
    url: String,
}

impl FunctionExecutor {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl JobExecutor for FunctionExecutor {
    fn kind(&self) -> &'static str {
        "function"
    }

    async fn execute(
        &self,
        unit: &WorkUnit,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ExecutionError> {
        let mut request = self
            .client
            .post(&self.url)
            .header("x-batchflow-workflow", &ctx.workflow)
            .header("x-batchflow-run-id", ctx.run_id.to_string())
            .header("x-batchflow-attempt", ctx.attempt.to_string())
            .json(unit.payload());
        if let Some(limit) = ctx.timeout {
            request = request.timeout(limit);
        }

        let classify = |e: reqwest::Error| match ctx.timeout {
            Some(limit) if e.is_timeout() => ExecutionError::TimedOut(limit),
            _ => ExecutionError::Http(e),
        };

        let response = request.send().await.map_err(classify)?;

        let status = response.status();
        debug!(run_id = %ctx.run_id, attempt = ctx.attempt, %status, "function responded");

        let body = response.text().await.map_err(classify)?;
        if !status.is_success() {
            return Err(ExecutionError::failed(format!(
                "function returned {status}: {}",
                body.trim()
            )));
        }

        if body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body)))
    }
}
