//! Smoke tests against a local observability stack (OTLP collector on 4317,
//! Tempo on 3200, Prometheus on 9090).
//!
//! Run with:
//! ```sh
//! cargo test --test telemetry_smoke_test -- --ignored --nocapture
//! ```

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use batchflow::engine::{RetryPolicy, Workflow};
use batchflow::executor::{ExecutionError, FnExecutor};
use batchflow::model::{State, WorkUnit};
use batchflow::store::MemoryIdempotencyStore;
use batchflow::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use serde_json::json;

static TELEMETRY: OnceLock<TelemetryGuard> = OnceLock::new();

fn ensure_telemetry() -> &'static TelemetryGuard {
    TELEMETRY.get_or_init(|| {
        init_telemetry(TelemetryConfig {
            endpoint: Some("http://localhost:4317".to_string()),
            service_name: "batchflow-smoke-test".to_string(),
            log_level: "debug".to_string(),
        })
        .expect("failed to init telemetry")
    })
}

/// Force-flush all providers and give backends time to ingest.
async fn flush_and_wait(guard: &TelemetryGuard) {
    guard.force_flush();
    tokio::time::sleep(Duration::from_secs(8)).await;
}

/// One succeeded run and one exhausted run, so every engine metric has data.
async fn exercise_engine() {
    let workflow = Workflow::builder("smoke")
        .executor(FnExecutor::new(|unit, _ctx| async move {
            if unit.payload()["fail"] == json!(true) {
                Err(ExecutionError::failed("smoke failure"))
            } else {
                Ok(json!({"ok": true}))
            }
        }))
        .store(Arc::new(MemoryIdempotencyStore::new()))
        .retry(RetryPolicy::fixed(2, Duration::from_millis(10)))
        .build()
        .unwrap();

    let ok = workflow
        .run(WorkUnit::new(json!({"id": uuid::Uuid::new_v4().to_string()})))
        .await;
    assert_eq!(ok.state, State::Succeeded);

    let failed = workflow
        .run(WorkUnit::new(
            json!({"id": uuid::Uuid::new_v4().to_string(), "fail": true}),
        ))
        .await;
    assert_eq!(failed.state, State::Failed);
}

/// GET a backend's JSON API and return the array found at `pointer`.
async fn query_array(url: &str, params: &[(&str, &str)], pointer: &str) -> Vec<serde_json::Value> {
    let resp = reqwest::Client::new()
        .get(url)
        .query(params)
        .send()
        .await
        .unwrap_or_else(|e| panic!("{url} unreachable: {e}"));
    let status = resp.status();
    assert!(status.is_success(), "{url} answered {status}");

    let body: serde_json::Value = resp.json().await.unwrap();
    body.pointer(pointer)
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
}

/// Exported signals reach the backends after one engine pass. Each test
/// drives its own runtime since the telemetry guard is process-wide.
fn with_exported_runs(check: impl AsyncFnOnce()) {
    tokio::runtime::Runtime::new().unwrap().block_on(async {
        let guard = ensure_telemetry();
        assert!(guard.is_exporting());
        exercise_engine().await;
        flush_and_wait(guard).await;
        check().await;
    });
}

#[test]
#[ignore]
fn run_spans_reach_tempo() {
    with_exported_runs(async || {
        let traces = query_array(
            "http://localhost:3200/api/search",
            &[("tags", "service.name=batchflow-smoke-test"), ("limit", "5")],
            "/traces",
        )
        .await;
        assert!(!traces.is_empty(), "no batchflow traces in Tempo");
    });
}

#[test]
#[ignore]
fn run_counters_reach_prometheus() {
    with_exported_runs(async || {
        for metric in ["batchflow_runs_finished_total", "batchflow_attempts_total"] {
            let series = query_array(
                "http://localhost:9090/api/v1/query",
                &[("query", metric)],
                "/data/result",
            )
            .await;
            assert!(!series.is_empty(), "{metric} missing from Prometheus");
        }
    });
}
