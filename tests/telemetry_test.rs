//! Integration tests for telemetry initialization and span helpers.

use batchflow::model::RunId;
use batchflow::telemetry::run::{record_state_transition, start_run_span};
use batchflow::telemetry::{TelemetryConfig, init_telemetry, metrics};
use opentelemetry::KeyValue;

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process; a second
    // initialization in the same test binary returns Err, which is fine.
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "batchflow-test".to_string(),
        log_level: "debug".to_string(),
    };
    if let Ok(guard) = init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn run_span_records_transitions() {
    let span = start_run_span("nightly-report", &RunId::new());
    record_state_transition(&span, "start", "check_idempotency");
    record_state_transition(&span, "check_idempotency", "executing");
    record_state_transition(&span, "executing", "succeeded");
}

#[test]
fn metric_instruments_accept_recordings_without_a_provider() {
    let workflow = KeyValue::new("workflow", "nightly-report");
    metrics::runs_started().add(1, &[workflow.clone()]);
    metrics::admissions().add(1, &[workflow.clone(), KeyValue::new("result", "admitted")]);
    metrics::attempts().add(1, &[workflow.clone(), KeyValue::new("outcome", "succeeded")]);
    metrics::attempt_duration_ms().record(12.5, &[workflow.clone()]);
    metrics::notifications().add(1, &[workflow.clone(), KeyValue::new("result", "delivered")]);
    metrics::runs_finished().add(
        1,
        &[
            workflow,
            KeyValue::new("state", "succeeded"),
            KeyValue::new("failure", "none"),
        ],
    );
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", "reports"),
            KeyValue::new("operation", "send"),
        ],
    );
}
