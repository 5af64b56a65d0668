//! Integration tests for transform failures, error handlers and retries

mod common;

use common::{fast_config, fast_runtime, scripted_runtime, wait_until, ScriptedRepository, SETTLE_TIMEOUT};
use flowkernel_core::{
    Context, ContextStatus, FailureOutcome, FlowError, FlowEvent, RetryHandle, Session,
    TraceStatus,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test]
async fn test_unhandled_failure_settles_run_as_error() {
    let runtime = fast_runtime();
    let mut events = runtime.subscribe_events();
    let flow = runtime.flow("fragile");
    flow.map("boom", |_| Err("transform exploded".into()));

    let trace_id = flow.start(vec![json!(1)], None).await.unwrap();
    let trace = runtime.wait_settled(&trace_id, SETTLE_TIMEOUT).await.unwrap();
    assert_eq!(trace.status, TraceStatus::Error);

    let contexts = runtime.repository().find_by_trace(&trace_id).await.unwrap();
    assert!(contexts.iter().any(|c| c.status == ContextStatus::Error));

    let mut failed = None;
    while let Ok(event) = events.try_recv() {
        if let FlowEvent::BatchFailed { node, error, outcome } = event {
            assert_eq!(node, "fragile:boom");
            assert_eq!(error, "transform exploded");
            failed = Some(outcome);
        }
    }
    assert!(matches!(failed, Some(FailureOutcome::Unhandled(_))));
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_node_handler_receives_failure() {
    let runtime = fast_runtime();
    let flow = runtime.flow("handled");
    let seen: Arc<Mutex<Vec<(String, String, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    flow.map("boom", |_| Err("nope".into())).on_error(move |failure| {
        record.lock().unwrap().push((
            failure.node().to_string(),
            failure.error().to_string(),
            failure.contexts().len(),
        ));
    });

    let trace_id = flow.start(vec![json!(1), json!(2)], None).await.unwrap();
    let trace = runtime.wait_settled(&trace_id, SETTLE_TIMEOUT).await.unwrap();

    assert_eq!(trace.status, TraceStatus::Error);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![("handled:boom".to_string(), "nope".to_string(), 2)]
    );
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_global_handler_catches_unhandled_nodes() {
    let runtime = fast_runtime();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    runtime.on_global_error(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let flow = runtime.flow("global");
    flow.map("echo", Ok).map("boom", |_| Err("late failure".into()));

    let trace_id = flow.start(vec![json!(1)], None).await.unwrap();
    runtime.wait_settled(&trace_id, SETTLE_TIMEOUT).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_retry_reruns_failed_batch_once() {
    let runtime = fast_runtime();
    let flow = runtime.flow("flaky");
    let attempts = Arc::new(AtomicUsize::new(0));
    let handle: Arc<Mutex<Option<RetryHandle>>> = Arc::new(Mutex::new(None));

    let counter = attempts.clone();
    let slot = handle.clone();
    flow.map("flaky", move |v| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err("first attempt fails".into())
        } else {
            Ok(json!(format!("ok:{}", v)))
        }
    })
    .on_error(move |failure| {
        *slot.lock().unwrap() = Some(failure.retry_handle());
    });

    let trace_id = flow.start(vec![json!(1)], None).await.unwrap();
    let trace = runtime.wait_settled(&trace_id, SETTLE_TIMEOUT).await.unwrap();
    assert_eq!(trace.status, TraceStatus::Error);

    let retry = handle.lock().unwrap().take().unwrap();
    assert_eq!(retry.node(), "flaky:flaky");
    assert_eq!(retry.contexts().len(), 1);
    let regenerated = retry.retry().await.unwrap();
    assert_eq!(regenerated.len(), 1);
    assert!(retry.is_used());
    assert!(retry.retry().await.unwrap().is_empty());

    let trace = runtime.wait_settled(&trace_id, SETTLE_TIMEOUT).await.unwrap();
    assert_eq!(trace.status, TraceStatus::Ready);
    assert_eq!(flow.values(&trace_id).await.unwrap(), vec![json!("ok:1")]);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    let contexts = runtime.repository().find_by_trace(&trace_id).await.unwrap();
    assert!(contexts.iter().all(|c| c.status != ContextStatus::Error));
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_retry_after_shutdown_of_owner() {
    let handle: Arc<Mutex<Option<RetryHandle>>> = Arc::new(Mutex::new(None));
    {
        let runtime = fast_runtime();
        let flow = runtime.flow("orphan");
        let slot = handle.clone();
        flow.map("boom", |_| Err("gone".into())).on_error(move |failure| {
            *slot.lock().unwrap() = Some(failure.retry_handle());
        });
        let trace_id = flow.start(vec![json!(1)], None).await.unwrap();
        runtime.wait_settled(&trace_id, SETTLE_TIMEOUT).await.unwrap();
        runtime.shutdown().await;
    }
    wait_until("retry handle", || handle.lock().unwrap().is_some()).await;

    let retry = handle.lock().unwrap().take().unwrap();
    assert!(matches!(retry.retry().await, Err(FlowError::Shutdown)));
}

#[tokio::test]
async fn test_offer_rejects_mixed_sessions() {
    let runtime = fast_runtime();
    let flow = runtime.flow("sessions");
    let echo = flow.map("echo", Ok);

    let mixed = vec![
        Context::new("sessions", "sessions:echo", json!(1), &Session::from("alice")),
        Context::new("sessions", "sessions:echo", json!(2), &Session::from("bob")),
    ];
    assert!(matches!(
        echo.offer(mixed).await,
        Err(FlowError::SessionMismatch { .. })
    ));
    assert_eq!(echo.offer(Vec::new()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unhandled_outcome_converts_to_error() {
    let runtime = fast_runtime();
    let mut events = runtime.subscribe_events();
    let flow = runtime.flow("strict");
    flow.map("boom", |_| Err("bad input".into()));

    let trace_id = flow.start(vec![json!(1)], None).await.unwrap();
    runtime.wait_settled(&trace_id, SETTLE_TIMEOUT).await.unwrap();

    let mut converted = None;
    while let Ok(event) = events.try_recv() {
        if let FlowEvent::BatchFailed { node, outcome, .. } = event {
            converted = Some(outcome.into_result(&node));
        }
    }
    match converted {
        Some(Err(FlowError::NodeExecution { node, error })) => {
            assert_eq!(node, "strict:boom");
            assert_eq!(error, "bad input");
        }
        other => panic!("expected a node execution error, got {:?}", other),
    }
    assert!(FailureOutcome::Handled.into_result("any").is_ok());
    assert!(matches!(
        runtime.node_ref("strict:missing"),
        Err(FlowError::UnknownNode(_))
    ));
    assert_eq!(runtime.node_ref("strict:boom").unwrap().id(), "strict:boom");
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_outputs_dispatched_after_repeated_store_failures() {
    let repo = Arc::new(ScriptedRepository::new());
    let runtime = scripted_runtime(&repo, fast_config());
    let flow = runtime.flow("stranded");
    flow.map("first", Ok)
        .map("second", |v| Ok(json!(format!("second:{}", v))));
    runtime.launch().await.unwrap();

    // every dispatch attempt fails, then the first two sweeps
    repo.fail_queued_lookups("stranded", 5);
    let trace_id = flow.start(vec![json!(1)], None).await.unwrap();
    let trace = runtime.wait_settled(&trace_id, SETTLE_TIMEOUT).await.unwrap();

    assert_eq!(trace.status, TraceStatus::Ready);
    assert_eq!(flow.values(&trace_id).await.unwrap(), vec![json!("second:1")]);
    assert_eq!(repo.failed_lookups(), 5);
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_dispatch_backoff_does_not_delay_other_nodes() {
    let repo = Arc::new(ScriptedRepository::new());
    let config = fast_config().with_idle_backoff(Duration::from_millis(500));
    let runtime = scripted_runtime(&repo, config);
    let stuck = runtime.flow("stuck");
    stuck.map("first", Ok).map("second", Ok);
    let free = runtime.flow("free");
    free.map("first", Ok)
        .map("second", |v| Ok(json!(format!("free:{}", v))));
    runtime.launch().await.unwrap();

    repo.fail_queued_lookups("stuck", usize::MAX);
    let stuck_trace = stuck.start(vec![json!(1)], None).await.unwrap();
    wait_until("a failed dispatch", || repo.failed_lookups() > 0).await;

    let started = tokio::time::Instant::now();
    let free_trace = free.start(vec![json!(2)], None).await.unwrap();
    let trace = runtime.wait_settled(&free_trace, SETTLE_TIMEOUT).await.unwrap();
    assert_eq!(trace.status, TraceStatus::Ready);
    assert!(
        started.elapsed() < Duration::from_millis(400),
        "free run took {:?}",
        started.elapsed()
    );
    assert_eq!(free.values(&free_trace).await.unwrap(), vec![json!("free:2")]);

    let stuck_state = runtime.trace(&stuck_trace).await.unwrap().unwrap();
    assert_eq!(stuck_state.status, TraceStatus::Running);
    runtime.shutdown().await;
}
