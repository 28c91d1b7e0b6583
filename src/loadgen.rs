//! Load-test driver
//!
//! Submits `set` operations at a target rate for a fixed duration and
//! aggregates the outcomes. Pacing uses a direct `governor` limiter, so
//! submissions are spread evenly instead of fired in per-second bursts.

use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{Quota, RateLimiter};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::operation::{Operation, Priority, SubmitOptions};
use crate::service::OperationQueue;

/// Load test parameters
#[derive(Debug, Clone)]
pub struct LoadTestOptions {
    /// Target submissions per second
    pub rps: u32,
    /// How long to keep submitting
    pub duration: Duration,
    /// Priority of generated requests
    pub priority: Priority,
    /// Execution timeout of generated requests
    pub execution_timeout: Duration,
    /// Prefix of generated keys
    pub key_prefix: String,
}

impl Default for LoadTestOptions {
    fn default() -> Self {
        Self {
            rps: 100,
            duration: Duration::from_secs(60),
            priority: Priority::Normal,
            execution_timeout: Duration::from_secs(5),
            key_prefix: "load_test_".to_string(),
        }
    }
}

/// Aggregated load test outcome
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    /// Submissions made
    pub total_requests: u64,
    /// Successful results
    pub successful_requests: u64,
    /// Failed results
    pub failed_requests: u64,
    /// Failures by error code
    pub errors: BTreeMap<String, u64>,
    /// Submissions per second actually achieved
    pub rps_achieved: f64,
    /// Failed / total
    pub error_rate: f64,
    /// Mean execution time of successful results
    pub avg_execution_time_ms: f64,
    /// Wall-clock duration including the drain of outstanding requests
    #[serde(with = "crate::config::humantime_serde")]
    pub elapsed: Duration,
}

/// Drive `queue` with `options.rps` set operations per second for
/// `options.duration`, then wait for every outstanding result.
pub async fn run_load_test(queue: Arc<OperationQueue>, options: &LoadTestOptions) -> LoadReport {
    info!(
        rps = options.rps,
        duration_secs = options.duration.as_secs(),
        "Starting KV load test"
    );

    // No burst: one submission per 1/rps interval.
    let limiter = RateLimiter::direct(
        Quota::per_second(NonZeroU32::new(options.rps).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::MIN),
    );
    let submit_options = SubmitOptions::default()
        .priority(options.priority)
        .execution_timeout(options.execution_timeout);

    let started = Instant::now();
    let deadline = started + options.duration;
    let mut tasks = JoinSet::new();
    let mut submitted: u64 = 0;

    while Instant::now() < deadline {
        limiter.until_ready().await;
        if Instant::now() >= deadline {
            break;
        }
        let operation = Operation::set(
            format!("{}{submitted}", options.key_prefix),
            json!(format!("test_value_{submitted}")),
        );
        let queue = Arc::clone(&queue);
        tasks.spawn(async move { queue.submit(operation, submit_options).await });
        submitted += 1;
    }

    let mut report = LoadReport {
        total_requests: submitted,
        ..LoadReport::default()
    };
    let mut execution_total = Duration::ZERO;

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(result)) => {
                report.successful_requests += 1;
                execution_total += result.execution_time;
            }
            Ok(Err(e)) => {
                report.failed_requests += 1;
                *report.errors.entry(e.code().to_string()).or_default() += 1;
            }
            Err(e) => {
                warn!(error = %e, "Load test submission task failed");
                report.failed_requests += 1;
                *report.errors.entry("join_error".to_string()).or_default() += 1;
            }
        }
    }

    report.elapsed = started.elapsed();
    let secs = report.elapsed.as_secs_f64();
    if secs > 0.0 {
        report.rps_achieved = as_f64(submitted) / secs;
    }
    if submitted > 0 {
        report.error_rate = as_f64(report.failed_requests) / as_f64(submitted);
    }
    if report.successful_requests > 0 {
        report.avg_execution_time_ms =
            execution_total.as_secs_f64() * 1000.0 / as_f64(report.successful_requests);
    }

    info!(
        total = report.total_requests,
        successful = report.successful_requests,
        rps_achieved = report.rps_achieved,
        error_rate = report.error_rate,
        "Load test completed"
    );
    report
}

#[allow(clippy::cast_precision_loss)]
fn as_f64(n: u64) -> f64 {
    n as f64
}
