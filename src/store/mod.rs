//! Store capability: the slow key-value backend behind the queue.
//!
//! The queue owns all concurrency policy; a [`Store`] only executes single
//! operations. Failures carry a typed [`ErrorClass`] so the retry controller
//! never has to guess from message text. Backends that can only report free
//! text implement [`LegacyStore`] and are wrapped in [`Classified`], which
//! falls back to substring matching.

mod memory;

pub use memory::MemoryStore;

use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::operation::{Operation, OperationKind};

/// Whether a store failure is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient: backend unavailable, timeouts, rate limiting
    Retryable,
    /// Permanent: malformed request, type errors
    Fatal,
}

/// Typed store failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreError {
    /// Retry classification
    pub class: ErrorClass,
    /// Backend-provided detail
    pub message: String,
}

impl StoreError {
    /// Transient failure
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Retryable,
            message: message.into(),
        }
    }

    /// Permanent failure
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Fatal,
            message: message.into(),
        }
    }

    /// Whether the failure is transient
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class == ErrorClass::Retryable
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let class = match self.class {
            ErrorClass::Retryable => "retryable",
            ErrorClass::Fatal => "fatal",
        };
        write!(f, "{} ({class})", self.message)
    }
}

impl std::error::Error for StoreError {}

/// Result of a store call
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Key-value backend capability
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Read `key`. Missing or expired keys yield `None`.
    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Write `key`, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<()>;

    /// Remove `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Increment `key` and return the new value. Non-numeric or missing
    /// values count from zero.
    async fn increment(&self, key: &str) -> StoreResult<i64>;

    /// Expire `key` after `ttl`. Returns whether the key existed.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;
}

/// Run `operation` against `store`, mapping every kind to a JSON value.
pub async fn execute(store: &dyn Store, operation: &Operation) -> StoreResult<Value> {
    let key = operation.key.as_str();
    match operation.kind {
        OperationKind::Get => Ok(store.get(key).await?.unwrap_or(Value::Null)),
        OperationKind::Set => {
            let value = operation
                .value
                .clone()
                .ok_or_else(|| StoreError::fatal(format!("set '{key}' without a value")))?;
            store.set(key, value, operation.ttl).await?;
            Ok(Value::Bool(true))
        }
        OperationKind::Delete => store.delete(key).await.map(Value::Bool),
        OperationKind::Increment => store.increment(key).await.map(Value::from),
        OperationKind::Expire => {
            let ttl = operation
                .ttl
                .ok_or_else(|| StoreError::fatal(format!("expire '{key}' without a ttl")))?;
            store.expire(key, ttl).await.map(Value::Bool)
        }
    }
}

#[async_trait]
impl<S: Store + ?Sized> Store for Arc<S> {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<()> {
        (**self).set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        (**self).delete(key).await
    }

    async fn increment(&self, key: &str) -> StoreResult<i64> {
        (**self).increment(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        (**self).expire(key, ttl).await
    }
}

// ============================================================================
// Legacy backends
// ============================================================================

/// Backend that reports failures as free text only
#[async_trait]
pub trait LegacyStore: Send + Sync + 'static {
    /// Read `key`
    async fn get(&self, key: &str) -> Result<Option<Value>, String>;
    /// Write `key`
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), String>;
    /// Remove `key`
    async fn delete(&self, key: &str) -> Result<bool, String>;
    /// Increment `key`
    async fn increment(&self, key: &str) -> Result<i64, String>;
    /// Expire `key`
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, String>;
}

static RETRYABLE_PATTERNS: LazyLock<Option<RegexSet>> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)network error",
        r"(?i)timeout",
        r"(?i)rate limit",
        r"(?i)temporary failure",
        r"(?i)service unavailable",
    ])
    .ok()
});

/// Classify a free-text failure. Last resort for backends without typed errors.
#[must_use]
pub fn classify_message(message: &str) -> ErrorClass {
    let retryable = RETRYABLE_PATTERNS
        .as_ref()
        .is_some_and(|set| set.is_match(message));
    if retryable {
        ErrorClass::Retryable
    } else {
        ErrorClass::Fatal
    }
}

/// Adapter turning a [`LegacyStore`] into a typed [`Store`]
pub struct Classified<S> {
    inner: S,
}

impl<S: LegacyStore> Classified<S> {
    /// Wrap a legacy backend
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

fn classified<T>(result: Result<T, String>) -> StoreResult<T> {
    result.map_err(|message| StoreError {
        class: classify_message(&message),
        message,
    })
}

#[async_trait]
impl<S: LegacyStore> Store for Classified<S> {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        classified(self.inner.get(key).await)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<()> {
        classified(self.inner.set(key, value, ttl).await)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        classified(self.inner.delete(key).await)
    }

    async fn increment(&self, key: &str) -> StoreResult<i64> {
        classified(self.inner.increment(key).await)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        classified(self.inner.expire(key, ttl).await)
    }
}
