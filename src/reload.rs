//! Live reconfiguration with diff patching.
//!
//! A running queue can take a new [`Config`]. The diff against the running
//! config decides what is applied in place:
//!
//! - queue limits and default timeouts, retry/backoff, the breaker's
//!   threshold, minimum samples and enabled flag, and alert thresholds are
//!   applied immediately;
//! - the breaker's error-rate policy and window shape, metrics and health
//!   check settings are fixed at start. Changes to them are logged and kept
//!   at their running values.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::config::{BreakerConfig, Config};

/// Structural diff between two [`Config`] snapshots
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConfigPatch {
    /// Queue limits or default timeouts changed
    pub queue_changed: bool,
    /// Backoff changed
    pub retry_changed: bool,
    /// Breaker threshold, minimum samples or enabled flag changed
    pub breaker_changed: bool,
    /// Alert thresholds or cooldown changed
    pub alerts_changed: bool,
    /// Fields that changed but only take effect on restart
    pub restart_required: Vec<&'static str>,
}

impl ConfigPatch {
    /// Returns `true` when no changes were detected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.queue_changed
            && !self.retry_changed
            && !self.breaker_changed
            && !self.alerts_changed
            && self.restart_required.is_empty()
    }

    /// Human-readable summary of the patch
    #[must_use]
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        for (changed, section) in [
            (self.queue_changed, "queue"),
            (self.retry_changed, "retry"),
            (self.breaker_changed, "breaker"),
            (self.alerts_changed, "alerts"),
        ] {
            if changed {
                parts.push(format!("{section} updated"));
            }
        }
        if !self.restart_required.is_empty() {
            parts.push(format!(
                "restart required for [{}]",
                self.restart_required.join(", ")
            ));
        }
        if parts.is_empty() {
            "no changes".to_string()
        } else {
            parts.join("; ")
        }
    }
}

/// Running configuration shared by the queue's public surface.
///
/// Readers clone the inner `Arc`; a reconfiguration swaps it whole.
pub struct LiveConfig {
    inner: RwLock<Arc<Config>>,
}

impl LiveConfig {
    /// Seed with the startup configuration
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            inner: RwLock::new(Arc::new(config)),
        }
    }

    /// Current configuration
    #[must_use]
    pub fn get(&self) -> Arc<Config> {
        Arc::clone(&self.inner.read())
    }

    /// Replace the current configuration
    pub fn set(&self, config: Config) {
        *self.inner.write() = Arc::new(config);
    }
}

/// Compute the diff between the running config and a requested one.
///
/// ```
/// use kv_backpressure::config::Config;
/// use kv_backpressure::reload::compute_diff;
///
/// let old = Config::default();
/// let mut new = Config::default();
/// new.queue.max_queue_size = 10;
/// let patch = compute_diff(&old, &new);
/// assert!(patch.queue_changed);
/// assert!(patch.restart_required.is_empty());
/// ```
#[must_use]
pub fn compute_diff(old: &Config, new: &Config) -> ConfigPatch {
    let mut patch = ConfigPatch {
        queue_changed: changed(&old.queue, &new.queue),
        retry_changed: changed(&old.retry, &new.retry),
        breaker_changed: changed(&BreakerGate::from(&old.breaker), &BreakerGate::from(&new.breaker)),
        alerts_changed: changed(&old.alerts, &new.alerts),
        restart_required: Vec::new(),
    };

    if old.breaker.policy != new.breaker.policy {
        patch.restart_required.push("breaker.policy");
    }
    if old.breaker.window_size != new.breaker.window_size {
        patch.restart_required.push("breaker.window_size");
    }
    if old.breaker.window_duration != new.breaker.window_duration {
        patch.restart_required.push("breaker.window_duration");
    }
    if changed(&old.metrics, &new.metrics) {
        patch.restart_required.push("metrics");
    }
    if changed(&old.health_check, &new.health_check) {
        patch.restart_required.push("health_check");
    }
    patch
}

/// `requested` with every restart-only field reset to its `running` value
#[must_use]
pub fn applicable(running: &Config, requested: Config) -> Config {
    let mut config = requested;
    config.breaker.policy = running.breaker.policy;
    config.breaker.window_size = running.breaker.window_size;
    config.breaker.window_duration = running.breaker.window_duration;
    config.metrics = running.metrics.clone();
    config.health_check = running.health_check.clone();
    config
}

/// The breaker fields that can change at runtime
#[derive(Serialize)]
struct BreakerGate {
    enabled: bool,
    error_threshold: f64,
    min_samples: usize,
}

impl From<&BreakerConfig> for BreakerGate {
    fn from(config: &BreakerConfig) -> Self {
        Self {
            enabled: config.enabled,
            error_threshold: config.error_threshold,
            min_samples: config.min_samples,
        }
    }
}

/// JSON comparison, so sections need no `PartialEq`.
fn changed<T: Serialize>(old: &T, new: &T) -> bool {
    serde_json::to_string(old).ok() != serde_json::to_string(new).ok()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::ErrorRatePolicy;

    #[test]
    fn identical_configs_produce_empty_patch() {
        let patch = compute_diff(&Config::default(), &Config::default());
        assert!(patch.is_empty());
        assert_eq!(patch.summary(), "no changes");
    }

    #[test]
    fn live_sections_are_flagged() {
        let old = Config::default();
        let mut new = Config::default();
        new.retry.backoff_base = Duration::from_millis(250);
        new.breaker.error_threshold = 0.2;
        new.alerts.cooldown = Duration::from_secs(1);

        let patch = compute_diff(&old, &new);
        assert!(!patch.queue_changed);
        assert!(patch.retry_changed);
        assert!(patch.breaker_changed);
        assert!(patch.alerts_changed);
        assert!(patch.restart_required.is_empty());
        assert_eq!(patch.summary(), "retry updated; breaker updated; alerts updated");
    }

    #[test]
    fn restart_only_fields_are_reported_and_kept() {
        let old = Config::default();
        let mut new = Config::default();
        new.breaker.policy = ErrorRatePolicy::Cumulative;
        new.breaker.window_size = 10;
        new.health_check.interval = Duration::from_secs(60);
        new.queue.max_concurrent_requests = 8;

        let patch = compute_diff(&old, &new);
        assert!(!patch.breaker_changed);
        assert_eq!(
            patch.restart_required,
            vec!["breaker.policy", "breaker.window_size", "health_check"]
        );

        let applied = applicable(&old, new);
        assert_eq!(applied.breaker.policy, ErrorRatePolicy::Rolling);
        assert_eq!(applied.breaker.window_size, 100);
        assert_eq!(applied.health_check.interval, Duration::from_secs(5));
        assert_eq!(applied.queue.max_concurrent_requests, 8);
    }

    #[test]
    fn live_config_swaps_whole_snapshot() {
        let live = LiveConfig::new(Config::default());
        let before = live.get();
        let mut next = Config::default();
        next.queue.max_queue_size = 7;
        live.set(next);
        assert_eq!(before.queue.max_queue_size, 100);
        assert_eq!(live.get().queue.max_queue_size, 7);
    }
}
