//! Retry, timeout and circuit breaker integration tests

mod common;

use std::sync::Arc;
use std::time::Duration;

use kv_backpressure::alert::AlertKind;
use kv_backpressure::breaker::CircuitState;
use kv_backpressure::config::ErrorRatePolicy;
use kv_backpressure::operation::{Operation, SubmitOptions};
use kv_backpressure::store::StoreError;
use kv_backpressure::Error;
use pretty_assertions::assert_eq;
use tokio::time::Instant;

use common::{ScriptedStore, Step, default_config, start, test_config, wait_until};

fn transient() -> Step {
    Step::Fail(StoreError::retryable("service unavailable"))
}

fn fatal() -> Step {
    Step::Fail(StoreError::fatal("malformed key"))
}

#[tokio::test(start_paused = true)]
async fn test_retryable_failures_are_retried_with_backoff() {
    let store = Arc::new(ScriptedStore::new().with_script([transient(), transient()]));
    let (queue, sink) = start(test_config(), store.clone()).await;

    let started = Instant::now();
    let result = queue
        .submit(Operation::set("k", "v"), SubmitOptions::default().max_retries(3))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.retry_count, 2);
    assert_eq!(store.call_count(), 3);
    // 100ms then 200ms of backoff.
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(320));

    let calls = store.calls();
    assert!(calls[1].started - calls[0].started >= Duration::from_millis(100));
    assert!(calls[2].started - calls[1].started >= Duration::from_millis(200));

    let snapshot = queue.metrics();
    assert_eq!(snapshot.retries, 2);
    assert_eq!(snapshot.successful_requests, 1);
    assert_eq!(snapshot.failed_requests, 0);
    assert!(sink.of_kind(AlertKind::OperationFailed).is_empty());

    queue.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_surface_last_error() {
    let store = Arc::new(ScriptedStore::new().always(transient()));
    let (queue, sink) = start(test_config(), store.clone()).await;

    let err = queue
        .submit(Operation::get("k"), SubmitOptions::default().max_retries(2))
        .await
        .unwrap_err();

    match err {
        Error::MaxRetriesExceeded { retries, last } => {
            assert_eq!(retries, 2);
            assert!(last.to_string().contains("service unavailable"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(store.call_count(), 3);

    let failed = sink.of_kind(AlertKind::OperationFailed);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].details["code"], "max_retries_exceeded");
    assert_eq!(failed[0].details["retry_count"], 2);

    queue.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_fatal_failure_is_not_retried() {
    let store = Arc::new(ScriptedStore::new().with_script([fatal()]));
    let (queue, _) = start(test_config(), store.clone()).await;

    let err = queue
        .submit(Operation::get("k"), SubmitOptions::default().max_retries(3))
        .await
        .unwrap_err();
    match err {
        Error::Operation(e) => assert_eq!(e.message, "malformed key"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(store.call_count(), 1);
    assert_eq!(queue.metrics().retries, 0);

    queue.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_execution_timeout_is_retried() {
    let store = Arc::new(ScriptedStore::new().with_script([Step::Hang]));
    let (queue, _) = start(test_config(), store.clone()).await;

    let started = Instant::now();
    let result = queue
        .submit(
            Operation::get("k"),
            SubmitOptions::default()
                .execution_timeout(Duration::from_secs(1))
                .max_retries(1),
        )
        .await
        .unwrap();

    assert_eq!(result.retry_count, 1);
    assert_eq!(store.call_count(), 2);
    assert!(started.elapsed() >= Duration::from_millis(1100));
    assert_eq!(queue.in_flight(), 0);

    queue.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_execution_timeout_without_retry_budget() {
    let store = Arc::new(ScriptedStore::new().always(Step::Hang));
    let (queue, _) = start(test_config(), store.clone()).await;

    let err = queue
        .submit(
            Operation::get("k"),
            SubmitOptions::default()
                .execution_timeout(Duration::from_millis(500))
                .max_retries(0),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ExecutionTimeout { timeout } if timeout == Duration::from_millis(500)));
    assert_eq!(store.call_count(), 1);
    assert_eq!(queue.in_flight(), 0);

    queue.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_circuit_opens_above_threshold_and_recovers() {
    let mut config = test_config();
    config.queue.max_concurrent_requests = 1;
    config.breaker.error_threshold = 0.5;
    config.breaker.window_duration = Duration::from_secs(10);
    let store = Arc::new(ScriptedStore::new());
    let (queue, sink) = start(config, store.clone()).await;

    queue.set("ok", 1, None).await.unwrap();
    store.push_script([fatal(), fatal()]);
    for key in ["bad-1", "bad-2"] {
        let err = queue
            .submit(Operation::get(key), SubmitOptions::default().max_retries(0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Operation(_)));
    }
    assert_eq!(store.call_count(), 3);

    // 2 failures, 1 success: 0.67 > 0.5.
    let err = queue.get("fourth").await.unwrap_err();
    assert!(matches!(err, Error::CircuitOpen { .. }));
    assert_eq!(store.call_count(), 3);
    assert_eq!(queue.circuit_state(), CircuitState::Open);
    assert_eq!(sink.of_kind(AlertKind::CircuitOpened).len(), 1);

    let again = queue.get("fifth").await.unwrap_err();
    assert!(matches!(again, Error::CircuitOpen { .. }));
    assert_eq!(store.call_count(), 3);

    // The failures age out of the rolling window.
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(queue.get("ok").await.unwrap(), Some(serde_json::json!(1)));
    assert_eq!(queue.circuit_state(), CircuitState::Closed);
    assert_eq!(sink.of_kind(AlertKind::CircuitClosed).len(), 1);
    assert_eq!(store.call_count(), 4);

    let snapshot = queue.metrics();
    assert_eq!(snapshot.rejected_requests, 2);
    assert_eq!(snapshot.failed_requests, 4);

    queue.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cumulative_policy_matches_lifetime_ratio() {
    let mut config = test_config();
    config.queue.max_concurrent_requests = 1;
    config.breaker.error_threshold = 0.5;
    config.breaker.policy = ErrorRatePolicy::Cumulative;
    let store = Arc::new(ScriptedStore::new());
    let (queue, _) = start(config, store.clone()).await;

    queue.set("a", 1, None).await.unwrap();
    queue.set("b", 2, None).await.unwrap();
    store.push_script([fatal(), fatal()]);
    for key in ["c", "d"] {
        queue
            .submit(Operation::get(key), SubmitOptions::default().max_retries(0))
            .await
            .unwrap_err();
    }
    // 2 of 4 failed: at the threshold, still closed.
    queue.get("a").await.unwrap();

    store.push_script([fatal(), fatal()]);
    for key in ["e", "f"] {
        queue
            .submit(Operation::get(key), SubmitOptions::default().max_retries(0))
            .await
            .unwrap_err();
    }
    // 4 of 7 failed.
    let err = queue.get("a").await.unwrap_err();
    assert!(matches!(err, Error::CircuitOpen { .. }));

    // Time alone does not close a cumulative breaker.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(matches!(queue.get("a").await, Err(Error::CircuitOpen { .. })));

    queue.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_is_retried_under_default_breaker() {
    let store = Arc::new(ScriptedStore::new());
    let (queue, sink) = start(default_config(), store.clone()).await;

    for i in 0..50 {
        queue.set(format!("warm-{i}"), i, None).await.unwrap();
    }
    store.push_script([transient()]);

    let result = queue
        .submit(Operation::get("k"), SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(result.retry_count, 1);
    assert_eq!(store.keys().iter().filter(|k| *k == "k").count(), 2);
    assert_eq!(queue.circuit_state(), CircuitState::Closed);
    assert!(sink.of_kind(AlertKind::CircuitOpened).is_empty());

    let snapshot = queue.metrics();
    assert_eq!(snapshot.retries, 1);
    assert_eq!(snapshot.failed_requests, 0);
    assert_eq!(snapshot.window_samples, 51);
    assert_eq!(snapshot.window_retries, 1);
    assert!(snapshot.error_rate.abs() < f64::EPSILON);

    queue.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_trip_default_breaker() {
    let store = Arc::new(ScriptedStore::new());
    let (queue, sink) = start(default_config(), store.clone()).await;

    queue.set("a", 1, None).await.unwrap();
    store.push_script([transient(), transient(), transient(), transient()]);

    // Three retries by default, all of them dispatched.
    let err = queue.get("k").await.unwrap_err();
    assert!(matches!(err, Error::MaxRetriesExceeded { retries: 3, .. }));
    assert_eq!(store.call_count(), 5);

    // 1 of 2 store-bound results failed: far above 0.001.
    let err = queue.get("a").await.unwrap_err();
    assert!(matches!(err, Error::CircuitOpen { .. }));
    assert_eq!(store.call_count(), 5);
    assert_eq!(sink.of_kind(AlertKind::CircuitOpened).len(), 1);

    queue.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_retry_into_full_queue_fails_with_queue_full() {
    let mut config = test_config();
    config.queue.max_concurrent_requests = 1;
    config.queue.max_queue_size = 1;
    let store = Arc::new(ScriptedStore::new().with_script([transient(), Step::Hang]));
    let (queue, sink) = start(config, store.clone()).await;

    let q = Arc::clone(&queue);
    let retrying = tokio::spawn(async move { q.get("retrying").await });
    wait_until(|| queue.retry_pending() == 1).await;

    let q = Arc::clone(&queue);
    let _blocker = tokio::spawn(async move {
        q.submit(
            Operation::get("blocker"),
            SubmitOptions::default().execution_timeout(Duration::from_secs(10)),
        )
        .await
    });
    wait_until(|| queue.in_flight() == 1).await;

    let q = Arc::clone(&queue);
    let _queued = tokio::spawn(async move { q.get("queued").await });
    wait_until(|| queue.queued() == 1).await;

    // The 100ms backoff ends while the only queue slot is taken.
    let err = retrying.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::QueueFull { capacity: 1 }), "unexpected error: {err:?}");
    assert_eq!(queue.retry_pending(), 0);
    assert_eq!(store.keys(), vec!["retrying", "blocker"]);

    let failed = sink.of_kind(AlertKind::OperationFailed);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].details["code"], "queue_full");
    assert_eq!(failed[0].details["retry_count"], 1);

    let snapshot = queue.metrics();
    assert_eq!(snapshot.retries, 1);
    assert_eq!(snapshot.rejected_requests, 1);

    queue.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_panicking_store_call_fails_request_and_frees_slot() {
    let mut config = test_config();
    config.queue.max_concurrent_requests = 1;
    let store = Arc::new(ScriptedStore::new().with_script([Step::Panic]));
    let (queue, sink) = start(config, store.clone()).await;

    let err = queue.get("k").await.unwrap_err();
    assert!(matches!(err, Error::Internal(_)), "unexpected error: {err:?}");
    assert_eq!(queue.in_flight(), 0);
    assert_eq!(sink.of_kind(AlertKind::OperationFailed).len(), 1);

    let snapshot = queue.metrics();
    assert_eq!(snapshot.total_requests, 1);
    assert_eq!(snapshot.failed_requests, 1);
    assert_eq!(snapshot.concurrent_requests, 0);

    // The only slot is free again.
    queue.set("k", 1, None).await.unwrap();
    assert_eq!(store.call_count(), 2);

    queue.shutdown().await.unwrap();
}
