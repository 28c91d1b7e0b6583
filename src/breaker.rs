//! Circuit breaker implementation
//!
//! The breaker holds no failure counts of its own. Before every dispatch it
//! reads the aggregator's error rate and compares it with the threshold:
//! above the threshold it is open, otherwise closed. There is no half-open
//! probing state. With the rolling policy the breaker closes once failures
//! age out of the window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::alert::{AlertEmitter, AlertKind};
use crate::config::BreakerConfig;
use crate::metrics::{ErrorRate, MetricsAggregator};
use crate::{Error, Result};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed (allowing requests)
    Closed,
    /// Circuit is open (failing requests fast)
    Open,
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    enabled: bool,
    threshold: f64,
    min_samples: u64,
}

impl From<&BreakerConfig> for Settings {
    fn from(config: &BreakerConfig) -> Self {
        Self {
            enabled: config.enabled,
            threshold: config.error_threshold,
            min_samples: config.min_samples as u64,
        }
    }
}

/// Error-rate gate consulted before each dispatch
pub struct CircuitBreaker {
    settings: RwLock<Settings>,
    state: RwLock<CircuitState>,
    /// Last state change timestamp (millis since epoch)
    last_state_change: AtomicU64,
    /// Number of times the breaker opened
    trips: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            settings: RwLock::new(Settings::from(config)),
            state: RwLock::new(CircuitState::Closed),
            last_state_change: AtomicU64::new(0),
            trips: AtomicU64::new(0),
        }
    }

    /// Recompute the state from `metrics` and admit or refuse a dispatch.
    ///
    /// Transitions are logged and reported to `alerts`.
    pub fn check(&self, metrics: &MetricsAggregator, alerts: &AlertEmitter) -> Result<()> {
        let settings = *self.settings.read();
        if !settings.enabled {
            self.transition_to(CircuitState::Closed, metrics.error_rate(), settings, alerts);
            return Ok(());
        }

        let error_rate = metrics.error_rate();
        let next = Self::evaluate(settings, error_rate);
        self.transition_to(next, error_rate, settings, alerts);

        match next {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(Error::CircuitOpen {
                error_rate: error_rate.rate,
                threshold: settings.threshold,
            }),
        }
    }

    /// Apply a new threshold, minimum sample count and enabled flag. Takes
    /// effect at the next dispatch.
    pub fn reconfigure(&self, config: &BreakerConfig) {
        *self.settings.write() = Settings::from(config);
        info!(
            enabled = config.enabled,
            error_threshold = config.error_threshold,
            min_samples = config.min_samples,
            "Circuit breaker reconfigured"
        );
    }

    fn evaluate(settings: Settings, error_rate: ErrorRate) -> CircuitState {
        if error_rate.samples >= settings.min_samples && error_rate.rate > settings.threshold {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    /// State as of the last check
    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    /// Times the breaker has opened
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    /// Human readable status
    #[must_use]
    pub fn status_message(&self) -> String {
        match self.state() {
            CircuitState::Closed => "circuit breaker is closed".to_string(),
            CircuitState::Open => {
                let since = self.last_state_change.load(Ordering::Relaxed);
                let elapsed_secs = now_millis().saturating_sub(since) / 1000;
                format!(
                    "circuit breaker is open for {elapsed_secs} seconds (threshold {:.4})",
                    self.settings.read().threshold
                )
            }
        }
    }

    fn transition_to(
        &self,
        new_state: CircuitState,
        error_rate: ErrorRate,
        settings: Settings,
        alerts: &AlertEmitter,
    ) {
        {
            let mut state = self.state.write();
            if *state == new_state {
                return;
            }
            *state = new_state;
        }
        self.last_state_change.store(now_millis(), Ordering::Relaxed);

        let details = json!({
            "error_rate": error_rate.rate,
            "samples": error_rate.samples,
            "threshold": settings.threshold,
        });
        match new_state {
            CircuitState::Open => {
                self.trips.fetch_add(1, Ordering::Relaxed);
                warn!(
                    error_rate = error_rate.rate,
                    threshold = settings.threshold,
                    "Circuit breaker opened"
                );
                alerts.emit(AlertKind::CircuitOpened, details);
            }
            CircuitState::Closed => {
                info!(error_rate = error_rate.rate, "Circuit breaker closed");
                alerts.emit(AlertKind::CircuitClosed, details);
            }
        }
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
