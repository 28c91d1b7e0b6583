//! Lifecycle integration tests - health probing, shutdown, snapshot restore

mod common;

use std::sync::Arc;
use std::time::Duration;

use kv_backpressure::alert::AlertKind;
use kv_backpressure::health::ProbeOutcome;
use kv_backpressure::metrics::MemorySnapshotStore;
use kv_backpressure::operation::{Operation, SubmitOptions};
use kv_backpressure::store::{MemoryStore, StoreError};
use kv_backpressure::Error;
use pretty_assertions::assert_eq;

use common::{ScriptedStore, Step, start, start_with_snapshots, test_config, wait_until};

#[tokio::test(start_paused = true)]
async fn test_background_health_probe_round_trip() {
    let mut config = test_config();
    config.health_check.enabled = true;
    config.health_check.interval = Duration::from_secs(5);
    let store = Arc::new(ScriptedStore::new());
    let (queue, sink) = start(config, store.clone()).await;

    tokio::time::sleep(Duration::from_millis(10_500)).await;

    let health = queue.health();
    assert!(health.healthy);
    assert_eq!(health.success_count, 2);
    assert_eq!(health.failure_count, 0);

    // set, get, delete, get per probe, all against a throwaway key
    let keys = store.keys();
    assert_eq!(keys.len(), 8);
    assert!(keys.iter().all(|k| k.starts_with("health_check_")));
    assert_ne!(keys[0], keys[4]);
    assert!(sink.alerts().is_empty());

    // Probes never go through the dispatcher.
    assert_eq!(queue.metrics().total_requests, 0);
    queue.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failing_store_raises_health_alerts() {
    let mut config = test_config();
    config.health_check.enabled = true;
    config.health_check.interval = Duration::from_secs(5);
    config.health_check.failure_threshold = 3;
    let store = Arc::new(ScriptedStore::new().always(Step::Fail(StoreError::retryable(
        "network error",
    ))));
    let (queue, sink) = start(config, store).await;

    tokio::time::sleep(Duration::from_millis(20_500)).await;

    let failed = sink.of_kind(AlertKind::HealthCheckFailed);
    assert_eq!(failed.len(), 4);
    assert!(failed[0].details["error"].as_str().unwrap().contains("network error"));
    assert_eq!(failed[3].details["consecutive_failures"], 4);
    assert_eq!(sink.of_kind(AlertKind::ConsecutiveHealthCheckFailures).len(), 1);

    let health = queue.health();
    assert!(!health.healthy);
    assert_eq!(health.consecutive_failures, 4);
    assert_eq!(queue.in_flight(), 0);
    queue.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_probe_on_demand() {
    let (queue, _) = start(test_config(), Arc::new(MemoryStore::new())).await;
    assert!(matches!(queue.probe().await, ProbeOutcome::Passed { .. }));
    assert_eq!(queue.health().success_count, 1);
    queue.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_fails_queued_and_retry_pending_requests() {
    let mut config = test_config();
    config.queue.max_concurrent_requests = 1;
    config.retry.backoff_base = Duration::from_secs(10);
    let snapshots = Arc::new(MemorySnapshotStore::new());
    let store = Arc::new(ScriptedStore::new().with_script([
        Step::Fail(StoreError::retryable("temporary failure")),
        Step::Hang,
    ]));
    let queue = start_with_snapshots(config, store.clone(), snapshots.clone()).await;

    let mut callers = Vec::new();
    let q = Arc::clone(&queue);
    callers.push(tokio::spawn(async move { q.get("retrying").await }));
    wait_until(|| queue.retry_pending() == 1).await;

    let q = Arc::clone(&queue);
    callers.push(tokio::spawn(async move {
        q.submit(
            Operation::get("blocker"),
            SubmitOptions::default().execution_timeout(Duration::from_secs(2)),
        )
        .await
        .map(|_| None)
    }));
    wait_until(|| queue.in_flight() == 1).await;

    for key in ["a", "b"] {
        let q = Arc::clone(&queue);
        callers.push(tokio::spawn(async move { q.get(key).await }));
    }
    wait_until(|| queue.queued() == 2).await;

    queue.shutdown().await.unwrap();

    for caller in callers {
        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Shutdown), "unexpected error: {err:?}");
    }
    assert_eq!(queue.queued(), 0);
    assert_eq!(queue.retry_pending(), 0);
    assert_eq!(store.keys(), vec!["retrying", "blocker"]);

    let history = snapshots.history();
    let last = history.last().unwrap();
    assert_eq!(last.total_requests, 4);
    assert_eq!(last.failed_requests, 4);

    assert!(matches!(queue.get("late").await, Err(Error::Shutdown)));
}

#[tokio::test]
async fn test_metrics_continue_from_persisted_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.metrics.snapshot_path = Some(dir.path().join("kv-metrics.json"));

    let store = Arc::new(MemoryStore::new());
    let (first, _) = start(config.clone(), store.clone()).await;
    for i in 0..3 {
        first.set(format!("k{i}"), i, None).await.unwrap();
    }
    first.shutdown().await.unwrap();

    let (second, _) = start(config, store).await;
    let restored = second.metrics();
    assert_eq!(restored.total_requests, 3);
    assert_eq!(restored.successful_requests, 3);

    second.increment("hits").await.unwrap();
    assert_eq!(second.metrics().total_requests, 4);
    second.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_ttl_expires_through_the_queue() {
    let (queue, _) = start(test_config(), Arc::new(MemoryStore::new())).await;

    queue
        .set("session", "token", Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert!(queue.get("session").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(queue.get("session").await.unwrap(), None);
    assert!(!queue.expire("session", Duration::from_secs(5)).await.unwrap());

    queue.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_out_of_range_ttl_is_a_typed_failure() {
    let (queue, _) = start(test_config(), Arc::new(MemoryStore::new())).await;

    let err = queue.set("k", 1, Some(Duration::MAX)).await.unwrap_err();
    match err {
        Error::Operation(e) => assert!(!e.is_retryable()),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(queue.in_flight(), 0);
    assert_eq!(queue.metrics().failed_requests, 1);
    assert_eq!(queue.get("k").await.unwrap(), None);

    queue.shutdown().await.unwrap();
}
