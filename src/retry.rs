//! Retry logic with exponential backoff
//!
//! Retries are not loops around the store call. A failed request goes back
//! through the admission queue after its delay, so it competes for slots and
//! honors priorities like any other request.

use std::time::Duration;

use tracing::debug;

use crate::Error;
use crate::config::RetryConfig;
use crate::operation::OperationRequest;

/// What to do with a failed execution
#[derive(Debug)]
pub enum RetryDecision {
    /// Resubmit after `delay`; `attempt` is the new retry count
    Retry {
        /// Backoff before re-admission
        delay: Duration,
        /// Retry number, starting at 1
        attempt: u32,
    },
    /// Deliver `error` to the caller
    GiveUp(Error),
}

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub backoff_base: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Maximum backoff
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            backoff_base: config.backoff_base,
            multiplier: config.backoff_multiplier,
            max_backoff: config.max_backoff,
        }
    }

    /// Delay before retry number `attempt` (1-based):
    /// `backoff_base * multiplier^(attempt - 1)`, capped at `max_backoff`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let nanos = (self.backoff_base.as_nanos() as f64 * factor).round();
        #[allow(clippy::cast_precision_loss)]
        let cap = self.max_backoff.as_nanos() as f64;
        if !nanos.is_finite() || nanos >= cap {
            return self.max_backoff;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let nanos = nanos as u64;
        Duration::from_nanos(nanos)
    }

    /// Classify `error` for `request` and consume a retry when one is due.
    ///
    /// Fatal errors are returned unchanged. Retryable errors with an
    /// exhausted budget become [`Error::MaxRetriesExceeded`] carrying the
    /// last error.
    pub fn decide(&self, request: &mut OperationRequest, error: Error) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::GiveUp(error);
        }

        match request.begin_retry() {
            Some(attempt) => {
                let delay = self.backoff(attempt);
                debug!(
                    request_id = %request.id,
                    attempt,
                    max_retries = request.max_retries,
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "Retrying after backoff"
                );
                RetryDecision::Retry { delay, attempt }
            }
            None if request.max_retries == 0 => RetryDecision::GiveUp(error),
            None => {
                debug!(
                    request_id = %request.id,
                    retries = request.retry_count(),
                    "Max retry attempts reached"
                );
                RetryDecision::GiveUp(Error::MaxRetriesExceeded {
                    retries: request.retry_count(),
                    last: Box::new(error),
                })
            }
        }
    }
}
