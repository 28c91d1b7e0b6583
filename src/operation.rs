//! Operation requests and results
//!
//! An [`Operation`] is what a caller wants done against the store. Once
//! admitted it is wrapped in an [`OperationRequest`] carrying the scheduling
//! attributes (priority, timeouts, retry budget) that the queue works with.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::{Error, Result};

/// Kind of store operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Read a key
    Get,
    /// Write a key, optionally with a time-to-live
    Set,
    /// Remove a key
    Delete,
    /// Increment a numeric key
    Increment,
    /// Set a time-to-live on an existing key
    Expire,
}

impl OperationKind {
    /// Stable lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Delete => "delete",
            Self::Increment => "increment",
            Self::Expire => "expire",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority tier. Ordering follows urgency: `Critical > High > Normal > Low`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work
    Low,
    /// Default tier
    #[default]
    Normal,
    /// Interactive work
    High,
    /// Must run ahead of everything else
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A store operation as submitted by a caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Operation kind
    pub kind: OperationKind,
    /// Target key
    pub key: String,
    /// Value payload (`set` only)
    pub value: Option<Value>,
    /// Time-to-live (`set` optional, `expire` required)
    #[serde(default, with = "crate::config::humantime_serde::option")]
    pub ttl: Option<Duration>,
}

impl Operation {
    /// Read `key`
    pub fn get(key: impl Into<String>) -> Self {
        Self::new(OperationKind::Get, key)
    }

    /// Write `value` to `key`
    pub fn set(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            value: Some(value.into()),
            ..Self::new(OperationKind::Set, key)
        }
    }

    /// Remove `key`
    pub fn delete(key: impl Into<String>) -> Self {
        Self::new(OperationKind::Delete, key)
    }

    /// Increment `key`
    pub fn increment(key: impl Into<String>) -> Self {
        Self::new(OperationKind::Increment, key)
    }

    /// Expire `key` after `ttl`
    pub fn expire(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::new(OperationKind::Expire, key)
        }
    }

    fn new(kind: OperationKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            value: None,
            ttl: None,
        }
    }

    /// Attach a time-to-live
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Reject malformed operations before admission.
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(Error::InvalidRequest("key must not be empty".to_string()));
        }
        match self.kind {
            OperationKind::Set if self.value.is_none() => Err(Error::InvalidRequest(format!(
                "set '{}' requires a value",
                self.key
            ))),
            OperationKind::Expire if self.ttl.is_none_or(|ttl| ttl.is_zero()) => Err(
                Error::InvalidRequest(format!("expire '{}' requires a non-zero ttl", self.key)),
            ),
            _ => Ok(()),
        }
    }
}

/// Per-submission overrides. Unset fields fall back to the queue configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitOptions {
    /// Priority tier
    pub priority: Option<Priority>,
    /// Execution timeout
    pub execution_timeout: Option<Duration>,
    /// Queue-wait timeout
    pub queue_timeout: Option<Duration>,
    /// Maximum retries for retryable failures
    pub max_retries: Option<u32>,
}

impl SubmitOptions {
    /// Set the priority tier
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the execution timeout
    #[must_use]
    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    /// Set the queue-wait timeout
    #[must_use]
    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = Some(timeout);
        self
    }

    /// Set the retry budget
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }
}

/// Unique request identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh identifier
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kv_{}", self.0.simple())
    }
}

/// An admitted operation together with its scheduling attributes
#[derive(Debug, Clone)]
pub struct OperationRequest {
    /// Unique id
    pub id: RequestId,
    /// The operation to run
    pub operation: Operation,
    /// Priority tier
    pub priority: Priority,
    arrival: Instant,
    /// Execution timeout
    pub execution_timeout: Duration,
    /// Queue-wait timeout, applied afresh on every admission
    pub queue_timeout: Duration,
    retry_count: u32,
    /// Retry budget
    pub max_retries: u32,
}

impl OperationRequest {
    /// Build a request arriving now
    #[must_use]
    pub fn new(
        operation: Operation,
        priority: Priority,
        execution_timeout: Duration,
        queue_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            id: RequestId::new(),
            operation,
            priority,
            arrival: Instant::now(),
            execution_timeout,
            queue_timeout,
            retry_count: 0,
            max_retries,
        }
    }

    /// Original arrival time. Never changes across retries.
    #[must_use]
    pub fn arrival(&self) -> Instant {
        self.arrival
    }

    /// Retries performed so far
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Whether another retry fits in the budget
    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Consume one retry. Returns the new retry count, or `None` when the
    /// budget is exhausted.
    pub fn begin_retry(&mut self) -> Option<u32> {
        if !self.can_retry() {
            return None;
        }
        self.retry_count += 1;
        Some(self.retry_count)
    }
}

/// Terminal successful result of a request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResult {
    /// Request this result belongs to
    pub request_id: RequestId,
    /// Operation kind
    pub kind: OperationKind,
    /// Returned value: the read value for `get` (null when absent), the new
    /// counter for `increment`, a boolean for the others
    pub value: Value,
    /// Duration of the successful execution attempt
    #[serde(with = "crate::config::humantime_serde")]
    pub execution_time: Duration,
    /// Time from original arrival to the final dispatch
    #[serde(with = "crate::config::humantime_serde")]
    pub queue_wait: Duration,
    /// Retries performed before success
    pub retry_count: u32,
}
