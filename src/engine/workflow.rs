//! The workflow engine: drives one run from delivery to a terminal state.
//!
//! ```text
//! Start -> CheckIdempotency -> Executing -> Succeeded
//!                  |              |  ^
//!                  |              +--+ retry (parked, fixed backoff)
//!                  |              v
//!                  |         NotifyFailure -> Failed
//!                  +-------------------------> Failed (duplicate, store error, bad key)
//! ```
//!
//! Runs share nothing except the idempotency store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use super::builder::WorkflowBuilder;
use super::retry::RetryPolicy;
use crate::archive::RunArchive;
use crate::error::{Error, Result};
use crate::executor::{ExecutionContext, JobExecutor};
use crate::key::KeyExpression;
use crate::model::{
    Admission, ExecutionAttempt, FailureKind, IdempotencyRecord, RunId, Signal, State, WorkUnit,
    WorkflowRun,
};
use crate::notify::{FailureNotice, Notifier};
use crate::store::IdempotencyStore;
use crate::telemetry::metrics;
use crate::telemetry::run::{record_state_transition, start_run_span};

/// A runnable workflow definition. Cheap to clone; clones share the same
/// executor, store, notifier, and in-flight accounting.
#[derive(Clone)]
pub struct Workflow {
    inner: Arc<Inner>,
}

pub(super) struct Inner {
    pub(super) name: String,
    pub(super) executor: Arc<dyn JobExecutor>,
    pub(super) store: Arc<dyn IdempotencyStore>,
    pub(super) notifier: Arc<dyn Notifier>,
    pub(super) archive: Option<Arc<dyn RunArchive>>,
    pub(super) key: KeyExpression,
    pub(super) retry: RetryPolicy,
    pub(super) timeout: Option<Duration>,
    /// Zero means unbounded.
    pub(super) max_in_flight: usize,
    pub(super) in_flight: AtomicUsize,
    pub(super) closed: AtomicBool,
}

/// A run handed off with [`Workflow::start`].
#[derive(Debug)]
pub struct RunHandle {
    id: RunId,
    handle: JoinHandle<WorkflowRun>,
}

impl RunHandle {
    pub fn id(&self) -> RunId {
        self.id
    }

    /// Wait for the run to reach a terminal state.
    pub async fn wait(self) -> Result<WorkflowRun> {
        self.handle
            .await
            .map_err(|e| Error::Other(format!("run {} did not complete: {e}", self.id)))
    }
}

/// Releases an in-flight slot when the spawned run finishes, panics, or is
/// dropped unpolled.
struct InFlightSlot(Arc<Inner>);

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Workflow {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name)
    }

    pub(super) fn from_inner(inner: Inner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn key_expression(&self) -> &KeyExpression {
        &self.inner.key
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    /// Runs started with [`Workflow::start`] that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Stop accepting new runs. Runs already in flight continue.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        info!(workflow = %self.inner.name, "workflow closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Run one work unit to completion in the current task.
    pub async fn run(&self, unit: WorkUnit) -> WorkflowRun {
        let run = WorkflowRun::new(&self.inner.name, unit);
        self.inner.drive(run).await
    }

    /// Hand a work unit off to a background task (fire and forget).
    ///
    /// Fails with [`Error::Closed`] when the workflow is closed or already has
    /// `max_in_flight` runs active.
    pub fn start(&self, unit: WorkUnit) -> Result<RunHandle> {
        if self.is_closed() {
            return Err(self.refused("workflow is closed"));
        }
        let slot = self.reserve_slot()?;

        let run = WorkflowRun::new(&self.inner.name, unit);
        let id = run.id;
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let _slot = slot;
            inner.drive(run).await
        });

        debug!(workflow = %self.inner.name, run_id = %id, "run handed off");
        Ok(RunHandle { id, handle })
    }

    /// The slot is released when the returned guard drops, including when a
    /// spawned run is dropped before it is first polled.
    fn reserve_slot(&self) -> Result<InFlightSlot> {
        let max = self.inner.max_in_flight;
        self.inner
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (max == 0 || current < max).then_some(current + 1)
            })
            .map(|_| InFlightSlot(Arc::clone(&self.inner)))
            .map_err(|current| self.refused(&format!("at capacity ({current} runs in flight)")))
    }

    fn refused(&self, reason: &str) -> Error {
        Error::Closed {
            workflow: self.inner.name.clone(),
            reason: reason.to_string(),
        }
    }
}

impl Inner {
    async fn drive(&self, mut run: WorkflowRun) -> WorkflowRun {
        let span = start_run_span(&self.name, &run.id);

        async {
            metrics::runs_started().add(1, &[KeyValue::new("workflow", self.name.clone())]);
            info!(executor = self.executor.kind(), key_expression = %self.key, "run started");

            while !run.state.is_terminal() {
                let signal = match run.state {
                    State::Start => Signal::Begin,
                    State::CheckIdempotency => self.check_idempotency(&mut run).await,
                    State::Executing => self.execute_attempt(&mut run).await,
                    State::NotifyFailure => self.notify_failure(&run).await,
                    State::Succeeded | State::Failed => break,
                };

                match run.apply(signal) {
                    Ok(from) => record_state_transition(&span, from.as_str(), run.state.as_str()),
                    Err(e) => {
                        error!(
                            state = %run.state,
                            ?signal,
                            error = %e,
                            "engine produced an invalid signal"
                        );
                        let from = run.state;
                        run.abort(e.to_string());
                        record_state_transition(&span, from.as_str(), run.state.as_str());
                    }
                }
            }

            self.finish(&run).await;
        }
        .instrument(span.clone())
        .await;

        run
    }

    async fn check_idempotency(&self, run: &mut WorkflowRun) -> Signal {
        let key = match self.key.extract(run.work_unit.payload()) {
            Ok(key) => key,
            Err(e) => {
                warn!(key_expression = %self.key, reason = %e, "no usable idempotency key");
                run.set_error(
                    FailureKind::InvalidKey,
                    format!("key expression {}: {e}", self.key),
                );
                self.count_admission("invalid_key");
                return Signal::InvalidKey;
            }
        };
        run.key = Some(key.clone());

        // admitted_at is the run's start time, not the time of the write.
        let record = IdempotencyRecord::new(key.clone(), run.started_at);
        match self.store.insert_if_absent(&record).await {
            Ok(Admission::Admitted) => {
                debug!(key = %key, "key admitted");
                self.count_admission(Admission::Admitted.as_str());
                Signal::Admitted
            }
            Ok(Admission::AlreadyExists) => {
                info!(key = %key, "duplicate delivery suppressed");
                run.set_error(
                    FailureKind::DuplicateAdmission,
                    format!("key {key} already admitted"),
                );
                self.count_admission(Admission::AlreadyExists.as_str());
                Signal::Duplicate
            }
            Err(e) => {
                error!(key = %key, error = %e, "idempotency check failed");
                run.set_error(FailureKind::StoreUnavailable, e.to_string());
                self.count_admission("store_error");
                Signal::StoreUnavailable
            }
        }
    }

    async fn execute_attempt(&self, run: &mut WorkflowRun) -> Signal {
        let previous = run.attempts.len() as u32;
        if previous > 0 {
            // Parked, not polling: the task is descheduled until the timer fires.
            tokio::time::sleep(self.retry.delay_after(previous)).await;
        }
        let number = previous + 1;

        let ctx = ExecutionContext {
            workflow: self.name.clone(),
            run_id: run.id,
            attempt: number,
            timeout: self.timeout,
        };

        let started_at = Utc::now();
        let start = Instant::now();
        let result = self.executor.execute(&run.work_unit, &ctx).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        metrics::attempt_duration_ms().record(
            duration_ms as f64,
            &[KeyValue::new("workflow", self.name.clone())],
        );

        match result {
            Ok(output) => {
                info!(attempt = number, duration_ms, "attempt succeeded");
                run.attempts.push(ExecutionAttempt {
                    number,
                    started_at,
                    duration_ms,
                    error: None,
                });
                run.output = Some(output);
                self.count_attempt("succeeded");
                Signal::Succeeded
            }
            Err(e) => {
                let message = e.to_string();
                run.attempts.push(ExecutionAttempt {
                    number,
                    started_at,
                    duration_ms,
                    error: Some(message.clone()),
                });
                self.count_attempt("transient_execution_failure");

                if self.retry.should_retry(number) {
                    warn!(
                        attempt = number,
                        max_attempts = self.retry.max_attempts,
                        retry_in = ?self.retry.delay_after(number),
                        error = %message,
                        "attempt failed, retrying"
                    );
                    Signal::AttemptFailed
                } else {
                    error!(attempts = number, error = %message, "retries exhausted");
                    run.set_error(FailureKind::ExhaustedRetries, message);
                    Signal::RetriesExhausted
                }
            }
        }
    }

    async fn notify_failure(&self, run: &WorkflowRun) -> Signal {
        let notice = FailureNotice::for_run(run);
        let result = match self.notifier.notify(&notice).await {
            Ok(()) => "delivered",
            Err(e) => {
                warn!(error = %e, "failure notification not delivered");
                "failed"
            }
        };
        metrics::notifications().add(
            1,
            &[
                KeyValue::new("workflow", self.name.clone()),
                KeyValue::new("result", result),
            ],
        );
        Signal::Notified
    }

    async fn finish(&self, run: &WorkflowRun) {
        let failure = run.failure_kind();
        metrics::runs_finished().add(
            1,
            &[
                KeyValue::new("workflow", self.name.clone()),
                KeyValue::new("state", run.state.as_str()),
                KeyValue::new("failure", failure.map(FailureKind::as_str).unwrap_or("none")),
            ],
        );

        match (run.state, failure) {
            (State::Succeeded, _) => {
                info!(attempts = run.attempts.len(), "run succeeded")
            }
            (_, Some(FailureKind::DuplicateAdmission)) => {
                debug!("run ended as a suppressed duplicate")
            }
            (_, kind) => warn!(
                failure = kind.map(FailureKind::as_str).unwrap_or("unknown"),
                attempts = run.attempts.len(),
                "run failed"
            ),
        }

        if let Some(archive) = &self.archive {
            if let Err(e) = archive.archive(run).await {
                warn!(error = %e, "run could not be archived");
            }
        }
    }

    fn count_admission(&self, result: &'static str) {
        metrics::admissions().add(
            1,
            &[
                KeyValue::new("workflow", self.name.clone()),
                KeyValue::new("result", result),
            ],
        );
    }

    fn count_attempt(&self, outcome: &'static str) {
        metrics::attempts().add(
            1,
            &[
                KeyValue::new("workflow", self.name.clone()),
                KeyValue::new("outcome", outcome),
            ],
        );
    }
}
