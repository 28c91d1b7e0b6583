//! Metrics aggregation
//!
//! [`MetricsAggregator`] is the only writer of the queue's metrics. It is
//! updated concurrently by in-flight operations and serializes those updates
//! behind one lock. Reads go through [`MetricsAggregator::snapshot`], which
//! has no side effects.
//!
//! Two error rates exist side by side:
//! - the rolling rate over recent terminal results of requests that reached
//!   the store (what the breaker uses by default), and
//! - the cumulative rate over all terminal results since start, rejections
//!   included.
//!
//! Attempts that fail and go back to backoff are counted as retries. They
//! never enter either rate: the caller has not been failed yet.

mod persist;
mod window;

pub use persist::{FileSnapshotStore, MemorySnapshotStore, NoopSnapshotStore, SnapshotStore};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::alert::AlertKind;
use crate::config::{AlertConfig, BreakerConfig, ErrorRatePolicy, MetricsConfig};
use crate::{Error, Result};
use window::OutcomeWindow;

/// Point-in-time view of the queue's metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSnapshot {
    /// Terminal results delivered
    pub total_requests: u64,
    /// Successful terminal results
    pub successful_requests: u64,
    /// Failed terminal results (includes rejections)
    pub failed_requests: u64,
    /// Failures that never reached the store: queue full, queue timeout,
    /// circuit open
    pub rejected_requests: u64,
    /// Retries scheduled
    pub retries: u64,
    /// EWMA of execution time
    pub avg_execution_time_ms: f64,
    /// EWMA of queue-wait time
    pub avg_queue_wait_ms: f64,
    /// Queued requests
    pub current_queue_size: usize,
    /// Executing requests
    pub concurrent_requests: usize,
    /// Error rate the breaker compares against its threshold
    pub error_rate: f64,
    /// Terminal results of store-bound requests in the rolling window
    pub window_samples: usize,
    /// Attempts sent back to backoff within the rolling window
    pub window_retries: usize,
    /// Most recent failure detail
    pub last_error: Option<String>,
    /// Last mutation time
    pub last_updated: DateTime<Utc>,
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            rejected_requests: 0,
            retries: 0,
            avg_execution_time_ms: 0.0,
            avg_queue_wait_ms: 0.0,
            current_queue_size: 0,
            concurrent_requests: 0,
            error_rate: 0.0,
            window_samples: 0,
            window_retries: 0,
            last_error: None,
            last_updated: Utc::now(),
        }
    }
}

/// Exponentially weighted moving average, seeded by the first sample
#[derive(Debug, Clone, Copy)]
struct Ewma {
    value: Option<f64>,
    alpha: f64,
}

impl Ewma {
    fn new(alpha: f64) -> Self {
        Self { value: None, alpha }
    }

    fn update(&mut self, sample: f64) {
        self.value = Some(match self.value {
            Some(v) => v * (1.0 - self.alpha) + sample * self.alpha,
            None => sample,
        });
    }

    fn get(self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

struct Inner {
    total: u64,
    successful: u64,
    failed: u64,
    rejected: u64,
    retries: u64,
    execution: Ewma,
    queue_wait: Ewma,
    window: OutcomeWindow,
    last_error: Option<String>,
    last_updated: DateTime<Utc>,
}

impl Inner {
    fn cumulative_error_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.failed as f64 / self.total as f64;
        rate
    }
}

/// Error rate as seen by the breaker
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorRate {
    /// Failure fraction (0.0-1.0)
    pub rate: f64,
    /// Number of outcomes the rate is computed over
    pub samples: u64,
}

/// Serialized, concurrently updated metrics
pub struct MetricsAggregator {
    inner: Mutex<Inner>,
    policy: ErrorRatePolicy,
    queue_depth: AtomicUsize,
    concurrency: AtomicUsize,
    persist_every: u64,
    snapshots: Arc<dyn SnapshotStore>,
}

impl MetricsAggregator {
    /// Create an aggregator persisting through `snapshots`
    #[must_use]
    pub fn new(
        config: &MetricsConfig,
        breaker: &BreakerConfig,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                total: 0,
                successful: 0,
                failed: 0,
                rejected: 0,
                retries: 0,
                execution: Ewma::new(config.ewma_alpha),
                queue_wait: Ewma::new(config.ewma_alpha),
                window: OutcomeWindow::new(breaker.window_size, breaker.window_duration),
                last_error: None,
                last_updated: Utc::now(),
            }),
            policy: breaker.policy,
            queue_depth: AtomicUsize::new(0),
            concurrency: AtomicUsize::new(0),
            persist_every: config.persist_every,
            snapshots,
        }
    }

    /// Continue counters and averages from the last persisted snapshot.
    pub async fn restore(&self) -> Result<bool> {
        let Some(saved) = self.snapshots.load().await? else {
            return Ok(false);
        };
        let mut inner = self.inner.lock();
        inner.total = saved.total_requests;
        inner.successful = saved.successful_requests;
        inner.failed = saved.failed_requests;
        inner.rejected = saved.rejected_requests;
        inner.retries = saved.retries;
        if saved.total_requests > 0 {
            inner.execution.value = Some(saved.avg_execution_time_ms);
            inner.queue_wait.value = Some(saved.avg_queue_wait_ms);
        }
        inner.last_error = saved.last_error;
        info!(total_requests = inner.total, "Restored metrics snapshot");
        Ok(true)
    }

    /// Write the current snapshot to durable storage.
    pub async fn persist(&self) -> Result<()> {
        self.snapshots.save(&self.snapshot()).await
    }

    fn persist_in_background(&self) {
        let snapshot = self.snapshot();
        let store = Arc::clone(&self.snapshots);
        tokio::spawn(async move {
            if let Err(e) = store.save(&snapshot).await {
                warn!(error = %e, "Failed to save KV metrics");
            }
        });
    }

    /// Record the duration of one execution attempt against the store.
    pub fn record_attempt(&self, elapsed: Duration) {
        telemetry_metrics::histogram!("kv_execution_seconds").record(elapsed.as_secs_f64());
    }

    /// Record a failed attempt being sent back to backoff.
    pub fn record_retry(&self) {
        {
            let mut inner = self.inner.lock();
            inner.retries += 1;
            inner.window.record_retried();
        }
        telemetry_metrics::counter!("kv_retries_total").increment(1);
    }

    /// Record a successful terminal result.
    pub fn record_success(&self, execution: Duration, queue_wait: Duration) {
        let total = {
            let mut inner = self.inner.lock();
            inner.total += 1;
            inner.successful += 1;
            inner.window.record_terminal(true);
            inner.execution.update(millis(execution));
            inner.queue_wait.update(millis(queue_wait));
            inner.last_updated = Utc::now();
            inner.total
        };
        telemetry_metrics::counter!("kv_requests_total", "outcome" => "success").increment(1);
        telemetry_metrics::histogram!("kv_queue_wait_seconds").record(queue_wait.as_secs_f64());
        self.after_terminal(total);
    }

    /// Record a failed terminal result. `execution` is `None` when the
    /// request never reached the store.
    pub fn record_failure(
        &self,
        error: &Error,
        execution: Option<Duration>,
        queue_wait: Option<Duration>,
    ) {
        let rejected = matches!(
            error,
            Error::QueueFull { .. } | Error::QueueTimeout { .. } | Error::CircuitOpen { .. }
        );
        let total = {
            let mut inner = self.inner.lock();
            inner.total += 1;
            inner.failed += 1;
            if rejected {
                inner.rejected += 1;
            }
            if let Some(execution) = execution {
                inner.window.record_terminal(false);
                inner.execution.update(millis(execution));
            }
            if let Some(queue_wait) = queue_wait {
                inner.queue_wait.update(millis(queue_wait));
            }
            inner.last_error = Some(error.to_string());
            inner.last_updated = Utc::now();
            inner.total
        };
        telemetry_metrics::counter!("kv_requests_total", "outcome" => error.code()).increment(1);
        self.after_terminal(total);
    }

    fn after_terminal(&self, total: u64) {
        if self.persist_every > 0 && total % self.persist_every == 0 {
            debug!(total, "Persisting metrics snapshot");
            self.persist_in_background();
        }
    }

    /// Update the queue depth gauge
    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth, Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        let depth = depth as f64;
        telemetry_metrics::gauge!("kv_queue_depth").set(depth);
    }

    /// Update the concurrency gauge
    pub fn set_concurrency(&self, executing: usize) {
        self.concurrency.store(executing, Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        let executing = executing as f64;
        telemetry_metrics::gauge!("kv_concurrency").set(executing);
    }

    /// Error rate under the configured policy
    pub fn error_rate(&self) -> ErrorRate {
        let mut inner = self.inner.lock();
        match self.policy {
            ErrorRatePolicy::Rolling => {
                let counts = inner.window.counts();
                ErrorRate {
                    rate: counts.error_rate(),
                    samples: counts.terminal() as u64,
                }
            }
            ErrorRatePolicy::Cumulative => ErrorRate {
                rate: inner.cumulative_error_rate(),
                samples: inner.total,
            },
        }
    }

    /// Read-only snapshot
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let ErrorRate { rate, .. } = self.error_rate();
        let mut inner = self.inner.lock();
        let counts = inner.window.counts();
        MetricsSnapshot {
            total_requests: inner.total,
            successful_requests: inner.successful,
            failed_requests: inner.failed,
            rejected_requests: inner.rejected,
            retries: inner.retries,
            avg_execution_time_ms: inner.execution.get(),
            avg_queue_wait_ms: inner.queue_wait.get(),
            current_queue_size: self.queue_depth.load(Ordering::Relaxed),
            concurrent_requests: self.concurrency.load(Ordering::Relaxed),
            error_rate: rate,
            window_samples: counts.terminal(),
            window_retries: counts.retried,
            last_error: inner.last_error.clone(),
            last_updated: inner.last_updated,
        }
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Threshold checks evaluated after terminal results and on each tick
#[derive(Debug, Clone)]
pub struct Thresholds {
    /// Breaker error threshold
    pub error_rate: f64,
    /// Queue utilization threshold (fraction)
    pub queue_utilization: f64,
    /// Average execution latency threshold
    pub latency: Duration,
    /// Queue capacity, for utilization
    pub queue_capacity: usize,
}

impl Thresholds {
    /// Assemble from configuration
    #[must_use]
    pub fn new(breaker: &BreakerConfig, alerts: &AlertConfig, queue_capacity: usize) -> Self {
        Self {
            error_rate: breaker.error_threshold,
            queue_utilization: alerts.queue_utilization_threshold,
            latency: alerts.latency_threshold,
            queue_capacity,
        }
    }

    /// Threshold breaches present in `snapshot`
    #[must_use]
    pub fn breaches(&self, snapshot: &MetricsSnapshot) -> Vec<(AlertKind, Value)> {
        let mut breaches = Vec::new();

        if snapshot.error_rate > self.error_rate {
            breaches.push((
                AlertKind::HighErrorRate,
                json!({ "current": snapshot.error_rate, "threshold": self.error_rate }),
            ));
        }

        if self.queue_capacity > 0 {
            #[allow(clippy::cast_precision_loss)]
            let utilization = snapshot.current_queue_size as f64 / self.queue_capacity as f64;
            if utilization > self.queue_utilization {
                breaches.push((
                    AlertKind::HighQueueUtilization,
                    json!({ "current": utilization, "threshold": self.queue_utilization }),
                ));
            }
        }

        let latency_ms = millis(self.latency);
        if snapshot.avg_execution_time_ms > latency_ms {
            breaches.push((
                AlertKind::HighLatency,
                json!({ "current": snapshot.avg_execution_time_ms, "threshold": latency_ms }),
            ));
        }

        breaches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator(policy: ErrorRatePolicy) -> MetricsAggregator {
        let breaker = BreakerConfig {
            policy,
            ..BreakerConfig::default()
        };
        MetricsAggregator::new(
            &MetricsConfig::default(),
            &breaker,
            Arc::new(NoopSnapshotStore),
        )
    }

    #[tokio::test]
    async fn counts_terminal_results() {
        let metrics = aggregator(ErrorRatePolicy::Rolling);
        metrics.record_success(Duration::from_millis(10), Duration::from_millis(1));
        metrics.record_failure(&Error::QueueFull { capacity: 2 }, None, None);
        metrics.record_failure(
            &Error::Operation(crate::store::StoreError::fatal("boom")),
            Some(Duration::from_millis(5)),
            Some(Duration::from_millis(2)),
        );

        let snap = metrics.snapshot();
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.successful_requests, 1);
        assert_eq!(snap.failed_requests, 2);
        assert_eq!(snap.rejected_requests, 1);
        assert!(snap.last_error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn ewma_smooths_latency() {
        let metrics = aggregator(ErrorRatePolicy::Rolling);
        metrics.record_success(Duration::from_millis(100), Duration::ZERO);
        metrics.record_success(Duration::from_millis(200), Duration::ZERO);

        let snap = metrics.snapshot();
        // 100 * 0.9 + 200 * 0.1
        assert!((snap.avg_execution_time_ms - 110.0).abs() < 1e-6);
    }

    fn store_failure(metrics: &MetricsAggregator) {
        metrics.record_failure(
            &Error::Operation(crate::store::StoreError::fatal("boom")),
            Some(Duration::from_millis(1)),
            Some(Duration::ZERO),
        );
    }

    #[tokio::test]
    async fn rolling_rate_tracks_store_bound_results_only() {
        let metrics = aggregator(ErrorRatePolicy::Rolling);
        store_failure(&metrics);
        store_failure(&metrics);
        metrics.record_success(Duration::from_millis(1), Duration::ZERO);
        metrics.record_failure(
            &Error::CircuitOpen {
                error_rate: 0.6,
                threshold: 0.5,
            },
            None,
            None,
        );

        let rate = metrics.error_rate();
        assert_eq!(rate.samples, 3);
        assert!((rate.rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn retried_attempts_do_not_raise_the_rate() {
        let metrics = aggregator(ErrorRatePolicy::Rolling);
        for _ in 0..50 {
            metrics.record_success(Duration::from_millis(1), Duration::ZERO);
        }
        metrics.record_retry();
        metrics.record_retry();

        let rate = metrics.error_rate();
        assert_eq!(rate.samples, 50);
        assert!(rate.rate.abs() < f64::EPSILON);
        let snap = metrics.snapshot();
        assert_eq!(snap.retries, 2);
        assert_eq!(snap.window_retries, 2);
        assert_eq!(snap.window_samples, 50);
    }

    #[tokio::test]
    async fn cumulative_rate_uses_terminal_counters() {
        let metrics = aggregator(ErrorRatePolicy::Cumulative);
        metrics.record_success(Duration::from_millis(1), Duration::ZERO);
        metrics.record_failure(&Error::QueueFull { capacity: 1 }, None, None);

        let rate = metrics.error_rate();
        assert_eq!(rate.samples, 2);
        assert!((rate.rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn persists_every_n_results_and_restores() {
        let store = Arc::new(MemorySnapshotStore::new());
        let config = MetricsConfig {
            persist_every: 2,
            ..MetricsConfig::default()
        };
        let metrics = MetricsAggregator::new(&config, &BreakerConfig::default(), store.clone());
        for _ in 0..4 {
            metrics.record_success(Duration::from_millis(20), Duration::from_millis(5));
        }
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(store.history().len(), 2);

        let restored = MetricsAggregator::new(&config, &BreakerConfig::default(), store.clone());
        assert!(restored.restore().await.unwrap());
        let snap = restored.snapshot();
        assert_eq!(snap.total_requests, 4);
        assert!((snap.avg_execution_time_ms - 20.0).abs() < 1e-6);
    }

    #[test]
    fn breaches_report_each_threshold() {
        let thresholds = Thresholds {
            error_rate: 0.1,
            queue_utilization: 0.8,
            latency: Duration::from_secs(5),
            queue_capacity: 10,
        };
        let calm = MetricsSnapshot::default();
        assert!(thresholds.breaches(&calm).is_empty());

        let stressed = MetricsSnapshot {
            error_rate: 0.5,
            current_queue_size: 9,
            avg_execution_time_ms: 6000.0,
            ..MetricsSnapshot::default()
        };
        let kinds: Vec<_> = thresholds
            .breaches(&stressed)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(
            kinds,
            vec![
                AlertKind::HighErrorRate,
                AlertKind::HighQueueUtilization,
                AlertKind::HighLatency
            ]
        );
    }
}
