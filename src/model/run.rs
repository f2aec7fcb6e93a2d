//! Workflow runs and the state machine that drives them.
//!
//! Error routing is an explicit transition table: `(State, Signal) -> State`.
//! The engine produces signals; the run applies them and keeps a log of every
//! transition it took.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::unit::WorkUnit;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Run ID
// ---------------------------------------------------------------------------

/// Newtype for workflow run IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Delivered by a trigger, nothing done yet.
    Start,
    /// Resolving the key and claiming it in the idempotency store.
    CheckIdempotency,
    /// Key admitted; the executor is running (or parked between retries).
    Executing,
    /// Retries exhausted; telling an operator.
    NotifyFailure,
    /// Terminal.
    Succeeded,
    /// Terminal. Includes suppressed duplicates.
    Failed,
}

/// What the engine observed in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Begin,
    Admitted,
    Duplicate,
    StoreUnavailable,
    InvalidKey,
    Succeeded,
    /// An attempt failed and another one is scheduled.
    AttemptFailed,
    RetriesExhausted,
    Notified,
}

impl State {
    /// The transition table. `None` means the signal is not valid here.
    pub fn next(self, signal: Signal) -> Option<State> {
        use Signal as S;
        use State::*;
        match (self, signal) {
            (Start, S::Begin) => Some(CheckIdempotency),
            (CheckIdempotency, S::Admitted) => Some(Executing),
            (CheckIdempotency, S::Duplicate | S::StoreUnavailable | S::InvalidKey) => {
                Some(Failed)
            }
            (Executing, S::Succeeded) => Some(Succeeded),
            (Executing, S::AttemptFailed) => Some(Executing),
            (Executing, S::RetriesExhausted) => Some(NotifyFailure),
            (NotifyFailure, S::Notified) => Some(Failed),
            _ => None,
        }
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Succeeded | State::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Start => "start",
            State::CheckIdempotency => "check_idempotency",
            State::Executing => "executing",
            State::NotifyFailure => "notify_failure",
            State::Succeeded => "succeeded",
            State::Failed => "failed",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(State::Start),
            "check_idempotency" => Ok(State::CheckIdempotency),
            "executing" => Ok(State::Executing),
            "notify_failure" => Ok(State::NotifyFailure),
            "succeeded" => Ok(State::Succeeded),
            "failed" => Ok(State::Failed),
            other => Err(Error::Other(format!("unknown run state: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// Why a run ended in `Failed`, or why one of its attempts failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Key already admitted by another run. Expected at-least-once noise.
    DuplicateAdmission,
    /// The idempotency check itself could not complete.
    StoreUnavailable,
    /// The key expression did not yield a usable key.
    InvalidKey,
    /// A single executor attempt failed. Recorded per attempt and retried;
    /// a run never ends with it.
    TransientExecutionFailure,
    /// Every attempt failed.
    ExhaustedRetries,
    /// The engine produced a signal its own table rejects.
    Internal,
}

impl FailureKind {
    /// Whether operators should be alerted. Duplicate admissions are not defects.
    pub fn is_alertable(self) -> bool {
        !matches!(self, FailureKind::DuplicateAdmission)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::DuplicateAdmission => "duplicate_admission",
            FailureKind::StoreUnavailable => "store_unavailable",
            FailureKind::InvalidKey => "invalid_key",
            FailureKind::TransientExecutionFailure => "transient_execution_failure",
            FailureKind::ExhaustedRetries => "exhausted_retries",
            FailureKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error captured on a failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: FailureKind,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Attempts and transitions
// ---------------------------------------------------------------------------

/// One call to the executor within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    /// 1-based.
    pub number: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// None when the attempt succeeded.
    pub error: Option<String>,
}

impl ExecutionAttempt {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// Every executor error is retryable, so a failed attempt is always
    /// transient.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error
            .as_ref()
            .map(|_| FailureKind::TransientExecutionFailure)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub from: State,
    pub to: State,
    pub signal: Signal,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Workflow run
// ---------------------------------------------------------------------------

/// A single execution of a workflow for one work unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    /// Name of the workflow definition this run belongs to.
    pub workflow: String,
    pub state: State,
    pub work_unit: WorkUnit,
    /// Resolved idempotency key, once extracted.
    pub key: Option<String>,
    pub attempts: Vec<ExecutionAttempt>,
    pub transitions: Vec<Transition>,
    /// Executor result on success. Opaque to the engine.
    pub output: Option<serde_json::Value>,
    pub error: Option<RunError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn new(workflow: impl Into<String>, work_unit: WorkUnit) -> Self {
        Self {
            id: RunId::new(),
            workflow: workflow.into(),
            state: State::Start,
            work_unit,
            key: None,
            attempts: Vec::new(),
            transitions: Vec::new(),
            output: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Apply a signal through the transition table. Returns the state left.
    pub fn apply(&mut self, signal: Signal) -> Result<State> {
        let from = self.state;
        let to = from.next(signal).ok_or_else(|| Error::InvalidTransition {
            from: from.to_string(),
            to: format!("{signal:?}"),
        })?;

        let now = Utc::now();
        self.transitions.push(Transition {
            from,
            to,
            signal,
            at: now,
        });
        self.state = to;
        if to.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(from)
    }

    /// Force the run to `Failed` outside the transition table. Only for an
    /// engine that produced a signal its own table rejects.
    pub fn abort(&mut self, message: impl Into<String>) {
        self.set_error(FailureKind::Internal, message);
        self.state = State::Failed;
        self.finished_at = Some(Utc::now());
    }

    /// Record a failure cause without changing state.
    pub fn set_error(&mut self, kind: FailureKind, message: impl Into<String>) {
        self.error = Some(RunError {
            kind,
            message: message.into(),
        });
    }

    /// Failure kind, if the run has one.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Terminal failures operators should hear about.
    pub fn is_alertable_failure(&self) -> bool {
        self.state == State::Failed && self.failure_kind().is_some_and(FailureKind::is_alertable)
    }

    /// Whether the executor was ever invoked.
    pub fn reached_execution(&self) -> bool {
        self.transitions.iter().any(|t| t.to == State::Executing)
    }

    /// The error of the most recent failed attempt.
    pub fn last_attempt_error(&self) -> Option<&str> {
        self.attempts.iter().rev().find_map(|a| a.error.as_deref())
    }
}
