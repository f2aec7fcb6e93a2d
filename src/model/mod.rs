//! Core data model.
//!
//! A work unit is one job invocation's input. A workflow run carries it from
//! admission to a terminal state; an idempotency record proves admission.

pub mod run;
pub mod unit;

pub use run::{
    ExecutionAttempt, FailureKind, RunError, RunId, Signal, State, Transition, WorkflowRun,
};
pub use unit::{Admission, IdempotencyRecord, WorkUnit};
