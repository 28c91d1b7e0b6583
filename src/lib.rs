//! KV Backpressure Library
//!
//! Backpressure-controlled operation queue in front of a slow,
//! rate-sensitive key-value store.
//!
//! # Features
//!
//! - **Priority admission**: bounded queue, strict priority then FIFO, immediate
//!   `QueueFull` rejection instead of blocking
//! - **Concurrency limit**: a single dispatch loop keeps at most
//!   `max_concurrent_requests` operations in flight
//! - **Failsafes**: exponential-backoff retries, execution and queue-wait
//!   timeouts, error-rate circuit breaker
//! - **Observability**: EWMA latencies, persisted metrics snapshots, threshold
//!   alerts, synthetic health probes
//! - **Live tuning**: limits, timeouts, backoff and thresholds can change on a
//!   running queue

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod alert;
pub mod breaker;
pub mod cli;
pub mod config;
mod dispatcher;
pub mod error;
pub mod health;
pub mod loadgen;
pub mod metrics;
pub mod operation;
pub mod queue;
pub mod reload;
pub mod retry;
pub mod service;
pub mod store;
pub mod timer;

pub use error::{Error, Result};
pub use operation::{Operation, OperationKind, OperationResult, Priority, SubmitOptions};
pub use service::OperationQueue;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
    }
}
