//! Alert emitter boundary
//!
//! Threshold breaches, terminal failures, circuit transitions and failed
//! health checks are pushed to an [`AlertSink`]. Delivery (chat webhook,
//! pager, log) belongs to the sink; the queue only decides what to send.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Alert type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Error rate above the breaker threshold
    HighErrorRate,
    /// Queue utilization above the configured fraction
    HighQueueUtilization,
    /// Average execution time above the configured latency
    HighLatency,
    /// A synthetic health round-trip failed
    HealthCheckFailed,
    /// Health checks failed `failure_threshold` times in a row
    ConsecutiveHealthCheckFailures,
    /// Breaker transitioned to open
    CircuitOpened,
    /// Breaker transitioned back to closed
    CircuitClosed,
    /// A request ended in a terminal failure
    OperationFailed,
}

impl AlertKind {
    /// Stable reason code
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HighErrorRate => "high_error_rate",
            Self::HighQueueUtilization => "high_queue_utilization",
            Self::HighLatency => "high_latency",
            Self::HealthCheckFailed => "health_check_failed",
            Self::ConsecutiveHealthCheckFailures => "consecutive_health_check_failures",
            Self::CircuitOpened => "circuit_opened",
            Self::CircuitClosed => "circuit_closed",
            Self::OperationFailed => "operation_failed",
        }
    }

    /// Default severity for this kind
    #[must_use]
    pub fn severity(self) -> Severity {
        match self {
            Self::CircuitClosed => Severity::Low,
            Self::OperationFailed | Self::HighLatency => Severity::Medium,
            Self::HighErrorRate | Self::HighQueueUtilization | Self::HealthCheckFailed => {
                Severity::High
            }
            Self::ConsecutiveHealthCheckFailures | Self::CircuitOpened => Severity::Critical,
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational
    Low,
    /// Worth a look
    Medium,
    /// Needs attention
    High,
    /// Needs attention now
    Critical,
}

/// A single alert event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Alert type
    #[serde(rename = "type")]
    pub kind: AlertKind,
    /// Severity
    pub severity: Severity,
    /// When the alert was raised
    pub timestamp: DateTime<Utc>,
    /// Kind-specific detail
    pub details: Value,
}

impl Alert {
    /// Build an alert raised now
    #[must_use]
    pub fn new(kind: AlertKind, details: Value) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            timestamp: Utc::now(),
            details,
        }
    }
}

/// Receiver of alerts. Must not block: hand slow delivery off to a task.
pub trait AlertSink: Send + Sync + 'static {
    /// Deliver one alert
    fn send(&self, alert: &Alert);
}

/// Writes alerts to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn send(&self, alert: &Alert) {
        match alert.severity {
            Severity::Critical => {
                error!(alert = %alert.kind, details = %alert.details, "KV back-pressure alert");
            }
            Severity::High | Severity::Medium => {
                warn!(alert = %alert.kind, details = %alert.details, "KV back-pressure alert");
            }
            Severity::Low => {
                debug!(alert = %alert.kind, details = %alert.details, "KV back-pressure alert");
            }
        }
    }
}

/// Forwards alerts to an unbounded channel for an async consumer
#[derive(Debug, Clone)]
pub struct ChannelAlertSink {
    tx: mpsc::UnboundedSender<Alert>,
}

impl ChannelAlertSink {
    /// Create a sink and its receiving end
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Alert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AlertSink for ChannelAlertSink {
    fn send(&self, alert: &Alert) {
        if self.tx.send(alert.clone()).is_err() {
            debug!(alert = %alert.kind, "Alert receiver dropped");
        }
    }
}

/// Keeps every alert in memory
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    /// Create an empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All alerts received so far
    #[must_use]
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    /// Alerts of one kind
    #[must_use]
    pub fn of_kind(&self, kind: AlertKind) -> Vec<Alert> {
        self.alerts
            .lock()
            .iter()
            .filter(|a| a.kind == kind)
            .cloned()
            .collect()
    }
}

impl AlertSink for MemoryAlertSink {
    fn send(&self, alert: &Alert) {
        self.alerts.lock().push(alert.clone());
    }
}

impl<S: AlertSink + ?Sized> AlertSink for Arc<S> {
    fn send(&self, alert: &Alert) {
        (**self).send(alert);
    }
}

/// Builds alerts and applies the per-kind cooldown to threshold alerts
pub struct AlertEmitter {
    sink: Arc<dyn AlertSink>,
    cooldown: Mutex<Duration>,
    last_sent: Mutex<HashMap<AlertKind, Instant>>,
}

impl AlertEmitter {
    /// Create an emitter over `sink`
    #[must_use]
    pub fn new(sink: Arc<dyn AlertSink>, cooldown: Duration) -> Self {
        Self {
            sink,
            cooldown: Mutex::new(cooldown),
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Change the per-kind cooldown for threshold alerts
    pub fn set_cooldown(&self, cooldown: Duration) {
        *self.cooldown.lock() = cooldown;
    }

    /// Send unconditionally
    pub fn emit(&self, kind: AlertKind, details: Value) {
        self.sink.send(&Alert::new(kind, details));
    }

    /// Send unless the same kind was sent within the cooldown.
    /// Returns whether the alert went out.
    pub fn emit_throttled(&self, kind: AlertKind, details: Value) -> bool {
        let now = Instant::now();
        let cooldown = *self.cooldown.lock();
        {
            let mut last_sent = self.last_sent.lock();
            if let Some(last) = last_sent.get(&kind)
                && now.duration_since(*last) < cooldown
            {
                return false;
            }
            last_sent.insert(kind, now);
        }
        self.emit(kind, details);
        true
    }
}
