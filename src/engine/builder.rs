//! Assembles a [`Workflow`] from its collaborators.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::time::Duration;

use super::retry::RetryPolicy;
use super::workflow::{Inner, Workflow};
use crate::archive::RunArchive;
use crate::error::{Error, Result};
use crate::executor::JobExecutor;
use crate::key::KeyExpression;
use crate::notify::{LogNotifier, Notifier};
use crate::store::IdempotencyStore;

/// Builder for a workflow. An executor and an idempotency store are required;
/// everything else has a default:
///
/// - key expression: `$.id`
/// - notifier: [`LogNotifier`]
/// - retry: [`RetryPolicy::FIXED`] (5 attempts, 10 s apart)
/// - no per-attempt timeout, no archive, unbounded in-flight runs
///
/// Runs of the same logical job must share one store (and key space); a store
/// may also be shared across unrelated workflows.
pub struct WorkflowBuilder {
    name: String,
    executor: Option<Arc<dyn JobExecutor>>,
    store: Option<Arc<dyn IdempotencyStore>>,
    notifier: Option<Arc<dyn Notifier>>,
    archive: Option<Arc<dyn RunArchive>>,
    key_expression: Option<String>,
    retry: RetryPolicy,
    timeout: Option<Duration>,
    max_in_flight: usize,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executor: None,
            store: None,
            notifier: None,
            archive: None,
            key_expression: None,
            retry: RetryPolicy::default(),
            timeout: None,
            max_in_flight: 0,
        }
    }

    pub fn executor(self, executor: impl JobExecutor + 'static) -> Self {
        self.shared_executor(Arc::new(executor))
    }

    pub fn shared_executor(mut self, executor: Arc<dyn JobExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn archive(mut self, archive: Arc<dyn RunArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Override the idempotency key expression, e.g. `$[0].messageId` for
    /// queue batches.
    pub fn key_expression(mut self, expression: impl Into<String>) -> Self {
        self.key_expression = Some(expression.into());
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Upper bound for each attempt, passed to the executor.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Cap on concurrent runs handed off with `start`. Zero is unbounded.
    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    pub fn build(self) -> Result<Workflow> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("workflow name must not be empty".to_string()));
        }
        let executor = self.executor.ok_or_else(|| {
            Error::Config(format!("workflow {} has no executor", self.name))
        })?;
        let store = self.store.ok_or_else(|| {
            Error::Config(format!("workflow {} has no idempotency store", self.name))
        })?;
        let key = match self.key_expression {
            Some(expression) => KeyExpression::parse(&expression)?,
            None => KeyExpression::default(),
        };

        Ok(Workflow::from_inner(Inner {
            name: self.name,
            executor,
            store,
            notifier: self.notifier.unwrap_or_else(|| Arc::new(LogNotifier)),
            archive: self.archive,
            key,
            retry: self.retry,
            timeout: self.timeout,
            max_in_flight: self.max_in_flight,
            in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }))
    }
}
