//! Workflow run span helpers.

use tracing::Span;

use crate::model::RunId;

/// Start a span covering one workflow run.
///
/// The `run.state` field is declared empty and updated by
/// [`record_state_transition`].
pub fn start_run_span(workflow: &str, run_id: &RunId) -> Span {
    tracing::info_span!(
        "workflow.run",
        "workflow.name" = workflow,
        "run.id" = %run_id,
        "run.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the span and emit it as an event.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("run.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
