//! Configuration management

use std::{path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Admission and concurrency limits
    pub queue: QueueConfig,
    /// Retry/backoff configuration
    pub retry: RetryConfig,
    /// Circuit breaker configuration
    pub breaker: BreakerConfig,
    /// Metrics aggregation and persistence
    pub metrics: MetricsConfig,
    /// Synthetic health check configuration
    pub health_check: HealthCheckConfig,
    /// Alert thresholds
    pub alerts: AlertConfig,
}

/// Admission queue and scheduler limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of operations executing at once
    pub max_concurrent_requests: usize,
    /// Maximum number of queued (not yet dispatched) operations
    pub max_queue_size: usize,
    /// Default execution timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Default queue-wait timeout
    #[serde(with = "humantime_serde")]
    pub queue_timeout: Duration,
    /// Default retry budget per request
    pub default_max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 5,
            max_queue_size: 100,
            request_timeout: Duration::from_secs(10),
            queue_timeout: Duration::from_secs(30),
            default_max_retries: 3,
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    /// Growth factor per retry
    pub backoff_multiplier: f64,
    /// Upper bound on a single delay
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// How the breaker computes its error rate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorRatePolicy {
    /// Recent terminal results of requests that reached the store, bounded
    /// by count and age. Retried attempts and rejections are not counted.
    #[default]
    Rolling,
    /// Every terminal result since start, including queue-full,
    /// queue-timeout and circuit-open rejections
    Cumulative,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Enable circuit breaker
    pub enabled: bool,
    /// Error rate (0.0-1.0) above which the breaker opens
    pub error_threshold: f64,
    /// Error rate policy
    pub policy: ErrorRatePolicy,
    /// Maximum terminal results kept in the rolling window
    pub window_size: usize,
    /// Maximum age of results in the rolling window
    #[serde(with = "humantime_serde")]
    pub window_duration: Duration,
    /// Results required before the breaker may open
    pub min_samples: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            error_threshold: 0.001,
            policy: ErrorRatePolicy::Rolling,
            window_size: 100,
            window_duration: Duration::from_secs(30),
            min_samples: 1,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// EWMA smoothing factor for latency averages
    pub ewma_alpha: f64,
    /// Persist a snapshot every N terminal results (0 disables)
    pub persist_every: u64,
    /// Snapshot file; no persistence when unset
    pub snapshot_path: Option<PathBuf>,
    /// Snapshots retained in the history file
    pub history_limit: usize,
    /// Gauge refresh and threshold alert interval
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            ewma_alpha: 0.1,
            persist_every: 10,
            snapshot_path: None,
            history_limit: 50,
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable health checks
    pub enabled: bool,
    /// Health check interval
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Health check timeout for the whole round-trip
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Consecutive failures before the store is reported unhealthy
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(5),
            failure_threshold: 3,
        }
    }
}

/// Alert threshold configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Queue utilization (0.0-1.0) above which an alert fires
    pub queue_utilization_threshold: f64,
    /// Average execution time above which an alert fires
    #[serde(with = "humantime_serde")]
    pub latency_threshold: Duration,
    /// Minimum gap between two threshold alerts of the same kind
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            queue_utilization_threshold: 0.8,
            latency_threshold: Duration::from_secs(5),
            cooldown: Duration::from_secs(5 * 60),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or holds out-of-range values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // KV_BACKPRESSURE_QUEUE__MAX_QUEUE_SIZE=50
        figment = figment.merge(Env::prefixed("KV_BACKPRESSURE_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_concurrent_requests == 0 {
            return Err(Error::Config("queue.max_concurrent_requests must be > 0".into()));
        }
        if self.queue.max_queue_size == 0 {
            return Err(Error::Config("queue.max_queue_size must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.breaker.error_threshold) {
            return Err(Error::Config("breaker.error_threshold must be within 0..=1".into()));
        }
        if self.breaker.window_size == 0 {
            return Err(Error::Config("breaker.window_size must be > 0".into()));
        }
        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return Err(Error::Config("retry.backoff_multiplier must be >= 1".into()));
        }
        if !(self.metrics.ewma_alpha > 0.0 && self.metrics.ewma_alpha <= 1.0) {
            return Err(Error::Config("metrics.ewma_alpha must be within (0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&self.alerts.queue_utilization_threshold) {
            return Err(Error::Config(
                "alerts.queue_utilization_threshold must be within 0..=1".into(),
            ));
        }
        if self.health_check.enabled && self.health_check.interval.is_zero() {
            return Err(Error::Config("health_check.interval must be > 0".into()));
        }
        if self.metrics.tick_interval.is_zero() {
            return Err(Error::Config("metrics.tick_interval must be > 0".into()));
        }
        Ok(())
    }
}

/// Human-readable `Duration` serde: "250ms", "30s", "5m", "1h" (bare numbers are seconds)
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize as whole seconds when exact, otherwise milliseconds
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    /// Deserialize "100ms", "30s", "5m" or "1h"
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn format_duration(duration: Duration) -> String {
        if duration.subsec_nanos() == 0 {
            format!("{}s", duration.as_secs())
        } else {
            format!("{}ms", duration.as_millis())
        }
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let parse = |n: &str| n.trim().parse::<u64>().map_err(|e| format!("invalid duration {s:?}: {e}"));

        // "ms" before "m" and "s"
        if let Some(ms) = s.strip_suffix("ms") {
            parse(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            parse(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            scaled(parse(mins)?, 60)
        } else if let Some(hours) = s.strip_suffix('h') {
            scaled(parse(hours)?, 3600)
        } else {
            parse(s).map(Duration::from_secs)
        }
    }

    fn scaled(n: u64, unit_secs: u64) -> Result<Duration, String> {
        n.checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration of {n} x {unit_secs}s is out of range"))
    }

    /// Same format for `Option<Duration>`
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        /// Serialize `Some` like a plain duration, `None` as null
        ///
        /// # Errors
        ///
        /// Returns a serialization error if the serializer fails.
        #[allow(clippy::ref_option)]
        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&super::format_duration(*d)),
                None => serializer.serialize_none(),
            }
        }

        /// Deserialize an optional duration string
        ///
        /// # Errors
        ///
        /// Returns a deserialization error if the string cannot be parsed as a duration.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| super::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
