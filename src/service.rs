//! Operation queue service
//!
//! [`OperationQueue`] wires the admission queue, dispatcher, breaker, metrics
//! aggregator, health prober and alert emitter together and exposes the
//! public surface: `submit`, typed convenience calls, observability reads,
//! live reconfiguration and graceful shutdown.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kv_backpressure::config::Config;
//! use kv_backpressure::operation::{Operation, Priority, SubmitOptions};
//! use kv_backpressure::service::OperationQueue;
//! use kv_backpressure::store::MemoryStore;
//!
//! # async fn demo() -> kv_backpressure::Result<()> {
//! let queue = OperationQueue::builder(Config::default(), Arc::new(MemoryStore::new()))
//!     .start()
//!     .await?;
//! let result = queue
//!     .submit(
//!         Operation::set("user:1", "alice"),
//!         SubmitOptions::default().priority(Priority::High),
//!     )
//!     .await?;
//! assert_eq!(result.value, true);
//! queue.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alert::{AlertEmitter, AlertSink, TracingAlertSink};
use crate::breaker::{CircuitBreaker, CircuitState};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, DispatcherParts};
use crate::health::{HealthProber, HealthStatus, ProbeOutcome};
use crate::metrics::{
    FileSnapshotStore, MetricsAggregator, MetricsSnapshot, NoopSnapshotStore, SnapshotStore,
    Thresholds,
};
use crate::operation::{Operation, OperationRequest, OperationResult, SubmitOptions};
use crate::reload::{ConfigPatch, LiveConfig, applicable, compute_diff};
use crate::retry::RetryPolicy;
use crate::store::Store;
use crate::timer::{Timer, TimerHandle, TokioTimer};
use crate::{Error, Result};

/// Builder for [`OperationQueue`]
pub struct OperationQueueBuilder {
    config: Config,
    store: Arc<dyn Store>,
    timer: Option<Arc<dyn Timer>>,
    alert_sink: Option<Arc<dyn AlertSink>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
}

impl OperationQueueBuilder {
    /// Use `timer` for deadlines, backoff and periodic tasks
    #[must_use]
    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Deliver alerts to `sink` (default: log them)
    #[must_use]
    pub fn alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = Some(sink);
        self
    }

    /// Persist metrics snapshots through `snapshots`. Defaults to a JSON
    /// file when `metrics.snapshot_path` is set, otherwise nothing is kept.
    #[must_use]
    pub fn snapshots(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Validate the configuration, restore the last metrics snapshot and
    /// start the dispatcher, health prober and metrics ticker.
    pub async fn start(self) -> Result<OperationQueue> {
        let Self {
            config,
            store,
            timer,
            alert_sink,
            snapshots,
        } = self;
        config.validate()?;

        let timer = timer.unwrap_or_else(|| Arc::new(TokioTimer));
        let alert_sink = alert_sink.unwrap_or_else(|| Arc::new(TracingAlertSink));
        let snapshots: Arc<dyn SnapshotStore> = match (snapshots, &config.metrics.snapshot_path) {
            (Some(snapshots), _) => snapshots,
            (None, Some(path)) => Arc::new(FileSnapshotStore::new(path, config.metrics.history_limit)),
            (None, None) => Arc::new(NoopSnapshotStore),
        };

        let metrics = Arc::new(MetricsAggregator::new(
            &config.metrics,
            &config.breaker,
            snapshots,
        ));
        match metrics.restore().await {
            Ok(true) => {}
            Ok(false) => debug!("No metrics snapshot to restore"),
            Err(e) => warn!(error = %e, "Failed to load KV metrics, starting from zero"),
        }

        let alerts = Arc::new(AlertEmitter::new(alert_sink, config.alerts.cooldown));
        let dispatcher = Arc::new(Dispatcher::new(DispatcherParts {
            max_queue_size: config.queue.max_queue_size,
            max_concurrent: config.queue.max_concurrent_requests,
            store: Arc::clone(&store),
            timer: Arc::clone(&timer),
            metrics: Arc::clone(&metrics),
            breaker: CircuitBreaker::new(&config.breaker),
            alerts: Arc::clone(&alerts),
            retry: RetryPolicy::new(&config.retry),
            thresholds: Thresholds::new(
                &config.breaker,
                &config.alerts,
                config.queue.max_queue_size,
            ),
        }));

        let shutdown = CancellationToken::new();
        let dispatch_task = tokio::spawn(Arc::clone(&dispatcher).run(shutdown.clone()));

        let prober = Arc::new(HealthProber::new(store, alerts, &config.health_check));
        let mut background = Vec::new();

        if config.health_check.enabled {
            let p = Arc::clone(&prober);
            background.push(timer.schedule_repeating(
                config.health_check.interval,
                Arc::new(move || -> BoxFuture<'static, ()> {
                    let p = Arc::clone(&p);
                    Box::pin(async move {
                        p.probe().await;
                    })
                }),
            ));
        }

        let d = Arc::clone(&dispatcher);
        background.push(timer.schedule_repeating(
            config.metrics.tick_interval,
            Arc::new(move || -> BoxFuture<'static, ()> {
                let d = Arc::clone(&d);
                Box::pin(async move {
                    d.tick();
                })
            }),
        ));

        info!(
            max_concurrent_requests = config.queue.max_concurrent_requests,
            max_queue_size = config.queue.max_queue_size,
            error_threshold = config.breaker.error_threshold,
            health_check = config.health_check.enabled,
            "KV operation queue started"
        );

        Ok(OperationQueue {
            config: LiveConfig::new(config),
            reconfiguring: Mutex::new(()),
            dispatcher,
            metrics,
            prober,
            background: Mutex::new(background),
            dispatch_task: Mutex::new(Some(dispatch_task)),
            shutdown,
        })
    }
}

/// Backpressure-controlled front for a key-value store
pub struct OperationQueue {
    config: LiveConfig,
    /// Serializes reconfigurations
    reconfiguring: Mutex<()>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<MetricsAggregator>,
    prober: Arc<HealthProber>,
    background: Mutex<Vec<TimerHandle>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl OperationQueue {
    /// Start building a queue in front of `store`
    #[must_use]
    pub fn builder(config: Config, store: Arc<dyn Store>) -> OperationQueueBuilder {
        OperationQueueBuilder {
            config,
            store,
            timer: None,
            alert_sink: None,
            snapshots: None,
        }
    }

    /// Submit an operation and wait for its terminal outcome.
    ///
    /// Fails immediately with [`Error::QueueFull`] when the queue is at
    /// capacity. Every other path is bounded by the queue-wait or execution
    /// timeout.
    pub async fn submit(&self, operation: Operation, options: SubmitOptions) -> Result<OperationResult> {
        operation.validate()?;
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }

        let config = self.config.get();
        let queue = &config.queue;
        let request = OperationRequest::new(
            operation,
            options.priority.unwrap_or_default(),
            options.execution_timeout.unwrap_or(queue.request_timeout),
            options.queue_timeout.unwrap_or(queue.queue_timeout),
            options.max_retries.unwrap_or(queue.default_max_retries),
        );
        self.dispatcher.submit(request).await
    }

    /// Read `key` with default options
    pub async fn get(&self, key: impl Into<String>) -> Result<Option<Value>> {
        let result = self.submit(Operation::get(key), SubmitOptions::default()).await?;
        Ok(match result.value {
            Value::Null => None,
            value => Some(value),
        })
    }

    /// Write `key` with default options
    pub async fn set(
        &self,
        key: impl Into<String>,
        value: impl Into<Value>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let operation = match ttl {
            Some(ttl) => Operation::set(key, value).with_ttl(ttl),
            None => Operation::set(key, value),
        };
        self.submit(operation, SubmitOptions::default()).await?;
        Ok(())
    }

    /// Remove `key` with default options. Returns whether it existed.
    pub async fn delete(&self, key: impl Into<String>) -> Result<bool> {
        let result = self.submit(Operation::delete(key), SubmitOptions::default()).await?;
        expect_bool(result.value)
    }

    /// Increment `key` with default options. Returns the new value.
    pub async fn increment(&self, key: impl Into<String>) -> Result<i64> {
        let result = self.submit(Operation::increment(key), SubmitOptions::default()).await?;
        result
            .value
            .as_i64()
            .ok_or_else(|| Error::Internal(format!("increment returned {}", result.value)))
    }

    /// Expire `key` after `ttl` with default options. Returns whether the
    /// key existed.
    pub async fn expire(&self, key: impl Into<String>, ttl: Duration) -> Result<bool> {
        let result = self
            .submit(Operation::expire(key, ttl), SubmitOptions::default())
            .await?;
        expect_bool(result.value)
    }

    /// Read-only metrics snapshot
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Health prober status
    #[must_use]
    pub fn health(&self) -> HealthStatus {
        self.prober.status()
    }

    /// Run one health probe now
    pub async fn probe(&self) -> ProbeOutcome {
        self.prober.probe().await
    }

    /// Breaker state as of the last dispatch
    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.dispatcher.breaker().state()
    }

    /// Human readable breaker status
    #[must_use]
    pub fn circuit_status(&self) -> String {
        self.dispatcher.breaker().status_message()
    }

    /// Requests waiting in the admission queue
    #[must_use]
    pub fn queued(&self) -> usize {
        self.dispatcher.queue_len()
    }

    /// Requests currently executing against the store
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.dispatcher.executing_len()
    }

    /// Requests waiting out a retry backoff
    #[must_use]
    pub fn retry_pending(&self) -> usize {
        self.dispatcher.backing_off_len()
    }

    /// Effective configuration
    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        self.config.get()
    }

    /// Apply `config` to the running queue.
    ///
    /// Queue limits, default timeouts, backoff, the breaker threshold and
    /// alert thresholds take effect for the next admission or dispatch.
    /// Requests already queued keep the timeouts they were admitted with.
    /// Fields listed in [`ConfigPatch::restart_required`] keep their running
    /// values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when `config` does not validate and
    /// [`Error::Shutdown`] once the queue is stopping.
    pub fn reconfigure(&self, config: Config) -> Result<ConfigPatch> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }
        config.validate()?;

        let _guard = self.reconfiguring.lock();
        let running = self.config.get();
        let patch = compute_diff(&running, &config);
        if patch.is_empty() {
            debug!("Reconfiguration without changes");
            return Ok(patch);
        }
        for field in &patch.restart_required {
            warn!(field, "Config change takes effect only after a restart");
        }

        let config = applicable(&running, config);
        self.dispatcher.reconfigure(&config);
        self.config.set(config);
        info!(changes = %patch.summary(), "KV operation queue reconfigured");
        Ok(patch)
    }

    /// Change part of the running configuration.
    ///
    /// ```no_run
    /// # fn demo(queue: &kv_backpressure::OperationQueue) -> kv_backpressure::Result<()> {
    /// queue.update_config(|config| {
    ///     config.queue.max_concurrent_requests = 10;
    ///     config.breaker.error_threshold = 0.05;
    /// })?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// See [`OperationQueue::reconfigure`].
    pub fn update_config(&self, update: impl FnOnce(&mut Config)) -> Result<ConfigPatch> {
        let mut config = Config::clone(&self.config.get());
        update(&mut config);
        self.reconfigure(config)
    }

    /// Stop dispatching and background tasks, fail every queued or
    /// retry-pending request with [`Error::Shutdown`], wait (bounded by the
    /// execution timeout) for in-flight operations and persist a final
    /// metrics snapshot. Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        info!("Shutting down KV operation queue");
        self.shutdown.cancel();
        self.stop_background();

        let dispatch_task = self.dispatch_task.lock().take();
        if let Some(task) = dispatch_task
            && let Err(e) = task.await
        {
            warn!(error = %e, "Dispatcher task ended abnormally");
        }

        let mut drained = self.dispatcher.close();
        let request_timeout = self.config.get().queue.request_timeout;
        if tokio::time::timeout(request_timeout, self.dispatcher.wait_idle())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.dispatcher.executing_len(),
                "In-flight operations did not finish before shutdown"
            );
        }
        // Retries scheduled by operations that finished during the wait.
        drained += self.dispatcher.close();

        self.metrics.persist().await?;
        info!(drained, "KV operation queue stopped");
        Ok(())
    }

    fn stop_background(&self) {
        for handle in self.background.lock().drain(..) {
            handle.cancel();
        }
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.stop_background();
    }
}

fn expect_bool(value: Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| Error::Internal(format!("expected a boolean result, got {value}")))
}
