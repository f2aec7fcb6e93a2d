//! Metric instrument factories for batchflow.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"batchflow"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("batchflow")
}

/// Counter: runs started.
/// Labels: `workflow`.
pub fn runs_started() -> Counter<u64> {
    meter()
        .u64_counter("batchflow.runs.started")
        .with_description("Number of workflow runs started")
        .build()
}

/// Counter: runs reaching a terminal state.
/// Labels: `workflow`, `state`, `failure` (a failure kind or "none").
pub fn runs_finished() -> Counter<u64> {
    meter()
        .u64_counter("batchflow.runs.finished")
        .with_description("Number of workflow runs reaching a terminal state")
        .build()
}

/// Counter: idempotency admission decisions.
/// Labels: `workflow`, `result` ("admitted" | "already_exists" | "store_error" | "invalid_key").
pub fn admissions() -> Counter<u64> {
    meter()
        .u64_counter("batchflow.admissions")
        .with_description("Idempotency admission decisions")
        .build()
}

/// Counter: executor attempts.
/// Labels: `workflow`, `outcome` ("succeeded" | "transient_execution_failure").
pub fn attempts() -> Counter<u64> {
    meter()
        .u64_counter("batchflow.attempts")
        .with_description("Number of executor attempts")
        .build()
}

/// Histogram: executor attempt duration in milliseconds.
/// Labels: `workflow`.
pub fn attempt_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("batchflow.attempt.duration_ms")
        .with_description("Executor attempt duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: failure notifications.
/// Labels: `workflow`, `result` ("delivered" | "failed").
pub fn notifications() -> Counter<u64> {
    meter()
        .u64_counter("batchflow.notifications")
        .with_description("Failure notifications attempted")
        .build()
}

/// Counter: trigger deliveries to a workflow.
/// Labels: `trigger`, `workflow`, `result` ("handed_off" | "refused" | "ignored").
pub fn trigger_deliveries() -> Counter<u64> {
    meter()
        .u64_counter("batchflow.trigger.deliveries")
        .with_description("Trigger deliveries to workflows")
        .build()
}

/// Counter: payloads routed to a dead-letter queue.
/// Labels: `trigger`, `workflow`.
pub fn dead_letters() -> Counter<u64> {
    meter()
        .u64_counter("batchflow.trigger.dead_letters")
        .with_description("Trigger payloads routed to a dead-letter queue")
        .build()
}

/// Counter: queue-level operations (send, read, archive).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("batchflow.queue.operations")
        .with_description("Number of queue operations")
        .build()
}
