//! Task executor: runs a program per attempt.
//!
//! The payload is passed in `TASK_INPUT` as JSON, along with the workflow
//! name, run id, and attempt number. A zero exit status is success; stdout is
//! the output (parsed as JSON when it is JSON, a string otherwise).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ExecutionContext, ExecutionError, JobExecutor};
use crate::model::WorkUnit;

/// How much stderr to carry into the failure message.
const STDERR_TAIL: usize = 2048;

#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Relative programs resolve against the process CWD, not wherever the
    /// child ends up running.
    fn resolved_program(&self) -> std::io::Result<PathBuf> {
        if self.program.is_relative() && self.program.components().count() > 1 {
            Ok(std::env::current_dir()?.join(&self.program))
        } else {
            Ok(self.program.clone())
        }
    }
}

#[async_trait]
impl JobExecutor for CommandExecutor {
    fn kind(&self) -> &'static str {
        "command"
    }

    async fn execute(
        &self,
        unit: &WorkUnit,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ExecutionError> {
        let program = self.resolved_program().map_err(ExecutionError::Spawn)?;
        let input = serde_json::to_string(unit.payload())
            .map_err(|e| ExecutionError::failed(format!("serialize task input: {e}")))?;

        debug!(
            run_id = %ctx.run_id,
            attempt = ctx.attempt,
            program = %program.display(),
            "starting task"
        );

        let mut command = Command::new(&program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("TASK_INPUT", input)
            .env("BATCHFLOW_WORKFLOW", &ctx.workflow)
            .env("BATCHFLOW_RUN_ID", ctx.run_id.to_string())
            .env("BATCHFLOW_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let child = command.spawn().map_err(ExecutionError::Spawn)?;

        let output = match ctx.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output,
                Err(_) => {
                    // Dropping the future drops the child, which kills it.
                    warn!(run_id = %ctx.run_id, attempt = ctx.attempt, ?limit, "task timed out");
                    return Err(ExecutionError::TimedOut(limit));
                }
            },
            None => child.wait_with_output().await,
        }
        .map_err(ExecutionError::Spawn)?;

        debug!(
            run_id = %ctx.run_id,
            attempt = ctx.attempt,
            duration_ms = start.elapsed().as_millis() as u64,
            status = ?output.status.code(),
            "task exited"
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = tail_chars(stderr.trim(), STDERR_TAIL);
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(if tail.is_empty() {
                ExecutionError::failed(format!("task exited with status {code}"))
            } else {
                ExecutionError::failed(format!("task exited with status {code}: {tail}"))
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(stdout)
            .unwrap_or_else(|_| serde_json::Value::String(stdout.to_string())))
    }
}

fn tail_chars(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    let skip = count - max;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}
