//! Synthetic store health checks
//!
//! The prober runs a write → read → delete → read round-trip with a throwaway
//! key on a fixed interval. It calls the store directly and never takes a
//! dispatcher slot, so user traffic and probes do not compete.
//!
//! Tracks:
//! - Success/failure counts and consecutive failures
//! - Round-trip latency percentiles (p50, p95, p99)
//! - Last success/failure timestamps

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::alert::{AlertEmitter, AlertKind};
use crate::config::HealthCheckConfig;
use crate::store::Store;

/// Default capacity for latency histogram
const DEFAULT_HISTOGRAM_CAPACITY: usize = 1000;

const PROBE_VALUE: &str = "ping";

/// Health tracker for probe outcomes
pub struct HealthTracker {
    failure_threshold: u64,
    healthy: AtomicBool,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    consecutive_failures: AtomicU64,
    /// Last successful probe timestamp (millis since epoch)
    last_success: AtomicU64,
    /// Last failed probe timestamp (millis since epoch)
    last_failure: AtomicU64,
    last_error: RwLock<Option<String>>,
    latencies: RwLock<LatencyHistogram>,
}

impl HealthTracker {
    /// Create a tracker that reports unhealthy after `failure_threshold`
    /// consecutive failures
    #[must_use]
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failure_threshold: u64::from(failure_threshold.max(1)),
            healthy: AtomicBool::new(true),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            last_success: AtomicU64::new(0),
            last_failure: AtomicU64::new(0),
            last_error: RwLock::new(None),
            latencies: RwLock::new(LatencyHistogram::new(DEFAULT_HISTOGRAM_CAPACITY)),
        }
    }

    /// Record a successful probe
    pub fn record_success(&self, latency: Duration) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.last_success.store(now_millis(), Ordering::Relaxed);
        self.latencies.write().record(latency);

        if !self.healthy.swap(true, Ordering::Relaxed) {
            info!("KV store recovered");
        }
    }

    /// Record a failed probe. Returns the consecutive failure count.
    pub fn record_failure(&self, error: &str) -> u64 {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        let consecutive = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_failure.store(now_millis(), Ordering::Relaxed);
        *self.last_error.write() = Some(error.to_string());

        if consecutive >= self.failure_threshold && self.healthy.swap(false, Ordering::Relaxed) {
            warn!(consecutive_failures = consecutive, "KV store marked unhealthy");
        }
        consecutive
    }

    /// Whether the store is currently considered healthy
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Current health status
    #[must_use]
    pub fn status(&self) -> HealthStatus {
        let latencies = self.latencies.read();

        HealthStatus {
            healthy: self.healthy.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            last_success_ms: self.last_success.load(Ordering::Relaxed),
            last_failure_ms: self.last_failure.load(Ordering::Relaxed),
            last_error: self.last_error.read().clone(),
            latency_p50_ms: latencies.percentile_ms(0.50),
            latency_p95_ms: latencies.percentile_ms(0.95),
            latency_p99_ms: latencies.percentile_ms(0.99),
        }
    }
}

/// Health status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Current health status
    pub healthy: bool,
    /// Total successful probes
    pub success_count: u64,
    /// Total failed probes
    pub failure_count: u64,
    /// Consecutive failures
    pub consecutive_failures: u64,
    /// Last success timestamp (millis since epoch)
    pub last_success_ms: u64,
    /// Last failure timestamp (millis since epoch)
    pub last_failure_ms: u64,
    /// Detail of the last failure
    pub last_error: Option<String>,
    /// 50th percentile round-trip latency (milliseconds)
    pub latency_p50_ms: Option<u64>,
    /// 95th percentile round-trip latency (milliseconds)
    pub latency_p95_ms: Option<u64>,
    /// 99th percentile round-trip latency (milliseconds)
    pub latency_p99_ms: Option<u64>,
}

/// Latency samples for percentile calculation
struct LatencyHistogram {
    /// Recent latency samples (in milliseconds)
    samples: VecDeque<u64>,
    capacity: usize,
}

impl LatencyHistogram {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn record(&mut self, latency: Duration) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples
            .push_back(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX));
    }

    /// Percentile (0.0 to 1.0) in milliseconds
    fn percentile_ms(&self, p: f64) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let index = ((sorted.len() as f64) * p).floor() as usize;
        sorted.get(index.min(sorted.len() - 1)).copied()
    }
}

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Round-trip succeeded
    Passed {
        /// Round-trip latency
        latency: Duration,
    },
    /// Round-trip failed
    Failed {
        /// Failure detail
        error: String,
        /// Consecutive failures including this one
        consecutive_failures: u64,
    },
}

/// Periodic synthetic round-trip against the store
pub struct HealthProber {
    store: Arc<dyn Store>,
    alerts: Arc<AlertEmitter>,
    tracker: HealthTracker,
    timeout: Duration,
}

impl HealthProber {
    /// Create a prober
    #[must_use]
    pub fn new(store: Arc<dyn Store>, alerts: Arc<AlertEmitter>, config: &HealthCheckConfig) -> Self {
        Self {
            store,
            alerts,
            tracker: HealthTracker::new(config.failure_threshold),
            timeout: config.timeout,
        }
    }

    /// Run one probe, record it and raise alerts on failure.
    pub async fn probe(&self) -> ProbeOutcome {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.round_trip()).await {
            Ok(result) => result,
            Err(_) => Err(format!("health check timed out after {:?}", self.timeout)),
        };

        match result {
            Ok(()) => {
                let latency = started.elapsed();
                self.tracker.record_success(latency);
                info!(latency_ms = latency.as_millis(), "KV health check passed");
                ProbeOutcome::Passed { latency }
            }
            Err(e) => {
                let consecutive = self.tracker.record_failure(&e);
                error!(error = %e, consecutive_failures = consecutive, "KV health check failed");
                self.alerts.emit(
                    AlertKind::HealthCheckFailed,
                    json!({ "error": e, "consecutive_failures": consecutive }),
                );
                if consecutive == self.tracker.failure_threshold {
                    self.alerts.emit(
                        AlertKind::ConsecutiveHealthCheckFailures,
                        json!({ "error": e, "consecutive_failures": consecutive }),
                    );
                }
                ProbeOutcome::Failed {
                    error: e,
                    consecutive_failures: consecutive,
                }
            }
        }
    }

    async fn round_trip(&self) -> Result<(), String> {
        let key = format!("health_check_{}", Uuid::new_v4().simple());
        let expected = Value::from(PROBE_VALUE);

        self.store
            .set(&key, expected.clone(), None)
            .await
            .map_err(|e| format!("set failed: {e}"))?;
        let read = self
            .store
            .get(&key)
            .await
            .map_err(|e| format!("get failed: {e}"))?;
        self.store
            .delete(&key)
            .await
            .map_err(|e| format!("delete failed: {e}"))?;

        if read.as_ref() != Some(&expected) {
            return Err(format!("Health check data mismatch: read {read:?}"));
        }

        let after_delete = self
            .store
            .get(&key)
            .await
            .map_err(|e| format!("get after delete failed: {e}"))?;
        if after_delete.is_some() {
            return Err("Health check key survived delete".to_string());
        }
        Ok(())
    }

    /// Current health status
    #[must_use]
    pub fn status(&self) -> HealthStatus {
        self.tracker.status()
    }
}

fn now_millis() -> u64 {
    u64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .unwrap_or(u64::MAX)
}
