//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kv_backpressure::alert::MemoryAlertSink;
use kv_backpressure::config::Config;
use kv_backpressure::metrics::SnapshotStore;
use kv_backpressure::service::OperationQueue;
use kv_backpressure::store::{MemoryStore, Store, StoreError, StoreResult};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

/// What a scripted call does before delegating to the in-memory store
#[derive(Debug, Clone)]
pub enum Step {
    /// Fail with this error
    Fail(StoreError),
    /// Never complete
    Hang,
    /// Panic inside the store call
    Panic,
}

/// One observed store call
#[derive(Debug, Clone)]
pub struct Call {
    pub key: String,
    pub started: Instant,
    /// Value returned by the observer when the call started
    pub observed: Option<u64>,
}

type Observer = Box<dyn Fn() -> u64 + Send + Sync>;

/// In-memory store with scripted failures, latency and call recording
pub struct ScriptedStore {
    inner: MemoryStore,
    delay: Duration,
    script: Mutex<VecDeque<Step>>,
    fallback: Option<Step>,
    calls: Mutex<Vec<Call>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    observer: Mutex<Option<Observer>>,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            delay: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            observer: Mutex::new(None),
        }
    }

    /// Every call takes `delay` before completing
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Calls consume `steps` in order, then behave normally
    pub fn with_script(self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.script.lock().extend(steps);
        self
    }

    /// Append `steps` to the script of a running store
    pub fn push_script(&self, steps: impl IntoIterator<Item = Step>) {
        self.script.lock().extend(steps);
    }

    /// Once the script is exhausted, every call does `step`
    pub fn always(mut self, step: Step) -> Self {
        self.fallback = Some(step);
        self
    }

    /// Record `observer()` at the start of every call
    pub fn observe(&self, observer: impl Fn() -> u64 + Send + Sync + 'static) {
        *self.observer.lock() = Some(Box::new(observer));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.key.clone()).collect()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    async fn step(&self, key: &str) -> StoreResult<()> {
        let observed = self.observer.lock().as_ref().map(|observe| observe());
        self.calls.lock().push(Call {
            key: key.to_string(),
            started: Instant::now(),
            observed,
        });

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        let step = self
            .script
            .lock()
            .pop_front()
            .or_else(|| self.fallback.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match step {
            Some(Step::Fail(e)) => Err(e),
            Some(Step::Hang) => std::future::pending().await,
            Some(Step::Panic) => panic!("store backend crashed on {key}"),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Store for ScriptedStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        self.step(key).await?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<()> {
        self.step(key).await?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.step(key).await?;
        self.inner.delete(key).await
    }

    async fn increment(&self, key: &str) -> StoreResult<i64> {
        self.step(key).await?;
        self.inner.increment(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.step(key).await?;
        self.inner.expire(key, ttl).await
    }
}

/// Defaults with the background prober off and a breaker that never opens
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.health_check.enabled = false;
    config.breaker.error_threshold = 1.0;
    config
}

/// Library defaults with only the background prober switched off
pub fn default_config() -> Config {
    let mut config = Config::default();
    config.health_check.enabled = false;
    config
}

/// Start a queue over `store`, collecting alerts in memory
pub async fn start(
    config: Config,
    store: Arc<dyn Store>,
) -> (Arc<OperationQueue>, Arc<MemoryAlertSink>) {
    let sink = Arc::new(MemoryAlertSink::new());
    let queue = OperationQueue::builder(config, store)
        .alert_sink(sink.clone())
        .start()
        .await
        .expect("queue starts");
    (Arc::new(queue), sink)
}

/// Start a queue that persists through `snapshots`
pub async fn start_with_snapshots(
    config: Config,
    store: Arc<dyn Store>,
    snapshots: Arc<dyn SnapshotStore>,
) -> Arc<OperationQueue> {
    let queue = OperationQueue::builder(config, store)
        .alert_sink(Arc::new(MemoryAlertSink::new()))
        .snapshots(snapshots)
        .start()
        .await
        .expect("queue starts");
    Arc::new(queue)
}

/// Poll `condition` on a 1ms cadence until it holds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}
