//! Integration tests for the workflow engine.
//!
//! Time is paused, so the 10 s retry interval elapses instantly while still
//! being observable through `tokio::time::Instant`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::Instant;

use batchflow::archive::{MemoryRunArchive, RunArchive, RunFilter};
use batchflow::engine::{RetryPolicy, Workflow, WorkflowBuilder};
use batchflow::error::{Error, Result};
use batchflow::executor::{ExecutionError, FnExecutor};
use batchflow::model::*;
use batchflow::notify::{FAILURE_MESSAGE, FailureNotice, Notifier};
use batchflow::store::{IdempotencyStore, MemoryIdempotencyStore};

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// Fails the first `failures` attempts of every run, then returns
/// `{"ok": true}`. Records when each attempt started.
fn flaky(failures: u32, starts: Arc<Mutex<Vec<Instant>>>) -> FnExecutor {
    FnExecutor::new(move |_unit, ctx| {
        let starts = Arc::clone(&starts);
        async move {
            starts.lock().push(Instant::now());
            let n = ctx.attempt;
            if n <= failures {
                Err(ExecutionError::failed(format!("boom #{n}")))
            } else {
                Ok(json!({"ok": true}))
            }
        }
    })
}

#[derive(Default)]
struct RecordingNotifier {
    notices: Mutex<Vec<FailureNotice>>,
}

impl RecordingNotifier {
    fn notices(&self) -> Vec<FailureNotice> {
        self.notices.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notice: &FailureNotice) -> Result<()> {
        self.notices.lock().push(notice.clone());
        Ok(())
    }
}

struct BrokenNotifier;

#[async_trait]
impl Notifier for BrokenNotifier {
    async fn notify(&self, _notice: &FailureNotice) -> Result<()> {
        Err(Error::Other("smtp down".to_string()))
    }
}

struct UnavailableStore;

#[async_trait]
impl IdempotencyStore for UnavailableStore {
    async fn insert_if_absent(&self, _record: &IdempotencyRecord) -> Result<Admission> {
        Err(Error::Other("connection refused".to_string()))
    }
}

struct Harness {
    workflow: Workflow,
    store: Arc<MemoryIdempotencyStore>,
    notifier: Arc<RecordingNotifier>,
    archive: Arc<MemoryRunArchive>,
    starts: Arc<Mutex<Vec<Instant>>>,
}

fn harness(failures: u32) -> Harness {
    harness_with(failures, |b| b)
}

fn harness_with(
    failures: u32,
    configure: impl FnOnce(WorkflowBuilder) -> WorkflowBuilder,
) -> Harness {
    let store = Arc::new(MemoryIdempotencyStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let archive = Arc::new(MemoryRunArchive::new());
    let starts = Arc::new(Mutex::new(Vec::new()));

    let builder = Workflow::builder("report")
        .executor(flaky(failures, Arc::clone(&starts)))
        .store(store.clone())
        .notifier(notifier.clone())
        .archive(archive.clone());
    let workflow = configure(builder).build().unwrap();

    Harness {
        workflow,
        store,
        notifier,
        archive,
        starts,
    }
}

fn job(id: &str) -> WorkUnit {
    WorkUnit::new(json!({"id": id}))
}

fn states(run: &WorkflowRun) -> Vec<State> {
    let mut out = vec![State::Start];
    out.extend(run.transitions.iter().map(|t| t.to));
    out
}

// ---------------------------------------------------------------------------
// Happy path and retries
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn first_attempt_success() {
    let h = harness(0);

    let run = h.workflow.run(job("job-1")).await;

    assert_eq!(run.state, State::Succeeded);
    assert_eq!(run.attempts.len(), 1);
    assert_eq!(run.output, Some(json!({"ok": true})));
    assert_eq!(run.key.as_deref(), Some("job-1"));
    assert!(run.error.is_none());
    assert!(run.finished_at.is_some());
    assert_eq!(
        states(&run),
        vec![
            State::Start,
            State::CheckIdempotency,
            State::Executing,
            State::Succeeded
        ]
    );
    assert!(h.notifier.notices().is_empty());
}

#[tokio::test(start_paused = true)]
async fn two_failures_then_success_keeps_one_record() {
    let h = harness(2);

    let run = h.workflow.run(job("job-42")).await;

    assert_eq!(run.state, State::Succeeded);
    assert_eq!(run.attempts.len(), 3);
    assert_eq!(run.attempts[0].error.as_deref(), Some("boom #1"));
    assert_eq!(run.attempts[1].error.as_deref(), Some("boom #2"));
    assert!(run.attempts[2].succeeded());
    assert_eq!(
        run.attempts[0].failure_kind(),
        Some(FailureKind::TransientExecutionFailure)
    );
    assert_eq!(run.attempts[2].failure_kind(), None);
    assert_eq!(h.store.len(), 1);
    assert!(h.store.get("job-42").is_some());
    assert!(h.notifier.notices().is_empty());
}

#[tokio::test(start_paused = true)]
async fn four_failures_still_succeed_on_last_attempt() {
    let h = harness(4);

    let run = h.workflow.run(job("job-4")).await;

    assert_eq!(run.state, State::Succeeded);
    assert_eq!(run.attempts.len(), 5);
    assert_eq!(h.store.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn always_failing_exhausts_five_attempts_ten_seconds_apart() {
    let h = harness(u32::MAX);

    let run = h.workflow.run(job("job-x")).await;

    assert_eq!(run.state, State::Failed);
    assert_eq!(run.failure_kind(), Some(FailureKind::ExhaustedRetries));
    assert!(run.is_alertable_failure());
    assert_eq!(run.attempts.len(), 5);

    let starts = h.starts.lock().clone();
    assert_eq!(starts.len(), 5);
    for pair in starts.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(10));
    }

    let notices = h.notifier.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].message, FAILURE_MESSAGE);
    assert_eq!(notices[0].error.as_deref(), Some("boom #5"));
    assert_eq!(notices[0].attempts, 5);
    assert_eq!(notices[0].key.as_deref(), Some("job-x"));

    // The admission record survives a failed run.
    assert_eq!(h.store.len(), 1);
    assert_eq!(*states(&run).last().unwrap(), State::Failed);
    assert!(states(&run).contains(&State::NotifyFailure));
}

#[tokio::test(start_paused = true)]
async fn retry_override_changes_attempts_and_interval() {
    let h = harness_with(u32::MAX, |b| b.retry(RetryPolicy::fixed(2, Duration::from_secs(3))));

    let run = h.workflow.run(job("job-r")).await;

    assert_eq!(run.attempts.len(), 2);
    let starts = h.starts.lock().clone();
    assert!(starts[1] - starts[0] >= Duration::from_secs(3));
    assert!(starts[1] - starts[0] < Duration::from_secs(10));
    assert_eq!(h.notifier.notices().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn attempt_timeout_counts_as_failure() {
    let store = Arc::new(MemoryIdempotencyStore::new());
    let workflow = Workflow::builder("slow")
        .executor(FnExecutor::new(|_unit, _ctx| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, ExecutionError>(json!(null))
        }))
        .store(store)
        .retry(RetryPolicy::NONE)
        .timeout(Duration::from_secs(1))
        .build()
        .unwrap();

    let run = workflow.run(job("job-t")).await;

    assert_eq!(run.state, State::Failed);
    assert_eq!(run.failure_kind(), Some(FailureKind::ExhaustedRetries));
    assert!(run.error.unwrap().message.contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn notifier_failure_still_ends_failed() {
    let store = Arc::new(MemoryIdempotencyStore::new());
    let workflow = Workflow::builder("quiet")
        .executor(FnExecutor::new(|_unit, _ctx| async {
            Err::<serde_json::Value, _>(ExecutionError::failed("nope"))
        }))
        .store(store)
        .notifier(Arc::new(BrokenNotifier))
        .retry(RetryPolicy::NONE)
        .build()
        .unwrap();

    let run = workflow.run(job("job-n")).await;

    assert_eq!(run.state, State::Failed);
    assert_eq!(run.failure_kind(), Some(FailureKind::ExhaustedRetries));
}

// ---------------------------------------------------------------------------
// Idempotency
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn repeated_delivery_is_suppressed() {
    let h = harness(0);

    let first = h.workflow.run(job("job-42")).await;
    let second = h.workflow.run(job("job-42")).await;

    assert_eq!(first.state, State::Succeeded);
    assert_eq!(second.state, State::Failed);
    assert_eq!(second.failure_kind(), Some(FailureKind::DuplicateAdmission));
    assert!(!second.is_alertable_failure());
    assert!(!second.reached_execution());
    assert!(second.attempts.is_empty());
    assert_eq!(h.starts.lock().len(), 1);
    assert_eq!(h.store.len(), 1);
    assert!(h.notifier.notices().is_empty());
}

#[tokio::test(start_paused = true)]
async fn concurrent_runs_with_same_key_execute_once() {
    let h = harness(0);

    let (a, b) = tokio::join!(h.workflow.run(job("dup")), h.workflow.run(job("dup")));

    let succeeded = [&a, &b]
        .iter()
        .filter(|r| r.state == State::Succeeded)
        .count();
    let duplicates = [&a, &b]
        .iter()
        .filter(|r| r.failure_kind() == Some(FailureKind::DuplicateAdmission))
        .count();
    assert_eq!(succeeded, 1);
    assert_eq!(duplicates, 1);
    assert_eq!(h.starts.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn many_spawned_runs_with_same_key_execute_once() {
    let h = harness(0);

    let handles: Vec<_> = (0..16)
        .map(|_| h.workflow.start(job("hot-key")).unwrap())
        .collect();
    let mut runs = Vec::new();
    for handle in handles {
        runs.push(handle.wait().await.unwrap());
    }

    assert_eq!(runs.iter().filter(|r| r.reached_execution()).count(), 1);
    assert_eq!(h.starts.lock().len(), 1);
    assert_eq!(h.store.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn distinct_keys_run_independently() {
    let h = harness(1);

    let a = h.workflow.run(job("a")).await;
    let b = h.workflow.run(job("b")).await;

    // Each run gets its own attempt numbering.
    for run in [&a, &b] {
        assert_eq!(run.state, State::Succeeded);
        assert_eq!(run.attempts.len(), 2);
        assert_eq!(run.attempts[0].error.as_deref(), Some("boom #1"));
    }
    assert_eq!(h.starts.lock().len(), 4);
    assert_eq!(h.store.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn queue_batch_is_keyed_by_first_message_id() {
    let h = harness_with(0, |b| b.key_expression("$[0].messageId"));

    let batch = WorkUnit::new(json!([
        {
            "messageId": "abc-123",
            "body": "hello",
            "enqueuedAt": "2024-03-01T00:00:00Z",
            "readCount": 1
        }
    ]));
    let run = h.workflow.run(batch).await;

    assert_eq!(run.state, State::Succeeded);
    assert_eq!(run.key.as_deref(), Some("abc-123"));
    assert!(h.store.get("abc-123").is_some());
}

#[tokio::test(start_paused = true)]
async fn admission_time_is_run_start() {
    let h = harness(0);

    let run = h.workflow.run(job("t")).await;
    let record = h.store.get("t").unwrap();

    assert_eq!(record.admitted_at, run.started_at);
}

// ---------------------------------------------------------------------------
// Failures before execution
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn store_outage_fails_closed_without_executing() {
    let notifier = Arc::new(RecordingNotifier::default());
    let starts = Arc::new(Mutex::new(Vec::new()));
    let workflow = Workflow::builder("outage")
        .executor(flaky(0, Arc::clone(&starts)))
        .store(Arc::new(UnavailableStore))
        .notifier(notifier.clone())
        .build()
        .unwrap();

    let run = workflow.run(job("job-s")).await;

    assert_eq!(run.state, State::Failed);
    assert_eq!(run.failure_kind(), Some(FailureKind::StoreUnavailable));
    assert!(run.is_alertable_failure());
    assert!(starts.lock().is_empty());
    assert!(notifier.notices().is_empty());
}

#[tokio::test(start_paused = true)]
async fn missing_key_fails_without_store_write() {
    let h = harness(0);

    for payload in [json!({}), json!({"id": ""}), json!({"id": null}), json!([1, 2])] {
        let run = h.workflow.run(WorkUnit::new(payload)).await;
        assert_eq!(run.state, State::Failed);
        assert_eq!(run.failure_kind(), Some(FailureKind::InvalidKey));
        assert!(run.key.is_none());
    }

    assert!(h.store.is_empty());
    assert!(h.starts.lock().is_empty());
    assert!(h.notifier.notices().is_empty());
}

#[tokio::test(start_paused = true)]
async fn integer_keys_are_admitted_as_text() {
    let h = harness(0);

    let run = h.workflow.run(WorkUnit::new(json!({"id": 42}))).await;

    assert_eq!(run.state, State::Succeeded);
    assert!(h.store.get("42").is_some());
}

// ---------------------------------------------------------------------------
// Hand-off, capacity, archive
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn closed_workflow_refuses_start() {
    let h = harness(0);
    h.workflow.close();

    let err = h.workflow.start(job("late")).unwrap_err();
    assert!(matches!(err, Error::Closed { .. }));
    assert!(h.store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn start_respects_max_in_flight() {
    let h = harness_with(u32::MAX, |b| b.max_in_flight(1));

    let first = h.workflow.start(job("one")).unwrap();
    assert_eq!(h.workflow.in_flight(), 1);
    assert!(matches!(
        h.workflow.start(job("two")),
        Err(Error::Closed { .. })
    ));

    let run = first.wait().await.unwrap();
    assert_eq!(run.state, State::Failed);
    assert_eq!(h.workflow.in_flight(), 0);
    assert!(h.workflow.start(job("three")).is_ok());
}

#[tokio::test(start_paused = true)]
async fn terminal_runs_are_archived() {
    let h = harness(0);

    let ok = h.workflow.run(job("k")).await;
    let dup = h.workflow.run(job("k")).await;

    assert_eq!(h.archive.len(), 2);
    assert_eq!(h.archive.get(ok.id).await.unwrap().state, State::Succeeded);

    let alertable = h
        .archive
        .list(&RunFilter {
            alertable_only: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(alertable.is_empty());

    let failed = h
        .archive
        .list(&RunFilter {
            state: Some(State::Failed),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, dup.id);
}

#[test]
fn builder_requires_executor_and_store() {
    let missing_store = Workflow::builder("x")
        .executor(FnExecutor::new(|_u, _c| async { Ok::<_, ExecutionError>(json!(null)) }))
        .build();
    assert!(matches!(missing_store, Err(Error::Config(_))));

    let missing_executor = Workflow::builder("x")
        .store(Arc::new(MemoryIdempotencyStore::new()))
        .build();
    assert!(matches!(missing_executor, Err(Error::Config(_))));

    let bad_key = Workflow::builder("x")
        .executor(FnExecutor::new(|_u, _c| async { Ok::<_, ExecutionError>(json!(null)) }))
        .store(Arc::new(MemoryIdempotencyStore::new()))
        .key_expression("id")
        .build();
    assert!(matches!(bad_key, Err(Error::KeyExpression { .. })));
}

#[test]
fn unpolled_run_releases_its_slot_on_runtime_shutdown() {
    let h = harness_with(0, |b| b.max_in_flight(1));
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();

    // block_on returns before the spawned run is ever polled.
    let handle = rt.block_on(async { h.workflow.start(job("orphan")).unwrap() });
    assert_eq!(h.workflow.in_flight(), 1);

    drop(rt);
    drop(handle);
    assert_eq!(h.workflow.in_flight(), 0);
    assert!(h.starts.lock().is_empty());
}
