//! Rolling window of store-bound request outcomes
//!
//! Two streams are kept apart. Terminal outcomes (a request that reached the
//! store and is now answered) feed the breaker. Retried attempts are kept
//! only for observability: a transient failure that is about to be retried
//! has not failed the caller yet and must not trip the breaker.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Outcome counts currently inside the window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct WindowCounts {
    /// Terminal successes
    pub succeeded: usize,
    /// Terminal failures after reaching the store
    pub failed: usize,
    /// Failed attempts that were scheduled for retry
    pub retried: usize,
}

impl WindowCounts {
    /// Terminal outcomes the error rate is computed over
    pub fn terminal(self) -> usize {
        self.succeeded + self.failed
    }

    /// `failed / terminal`, 0 when empty
    pub fn error_rate(self) -> f64 {
        if self.terminal() == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.failed as f64 / self.terminal() as f64;
        rate
    }
}

/// Terminal outcomes bounded by count and age, plus recent retried attempts.
#[derive(Debug)]
pub(crate) struct OutcomeWindow {
    /// `(finished_at, succeeded)` per answered request
    terminal: VecDeque<(Instant, bool)>,
    retried: VecDeque<Instant>,
    capacity: usize,
    max_age: Duration,
}

impl OutcomeWindow {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            terminal: VecDeque::with_capacity(capacity.min(4096)),
            retried: VecDeque::new(),
            capacity,
            max_age,
        }
    }

    /// A request that reached the store was answered.
    pub fn record_terminal(&mut self, succeeded: bool) {
        let now = Instant::now();
        self.evict(now);
        self.terminal.push_back((now, succeeded));
        if self.terminal.len() > self.capacity {
            self.terminal.pop_front();
        }
    }

    /// A failed attempt went back to backoff.
    pub fn record_retried(&mut self) {
        let now = Instant::now();
        self.evict(now);
        self.retried.push_back(now);
        if self.retried.len() > self.capacity {
            self.retried.pop_front();
        }
    }

    pub fn counts(&mut self) -> WindowCounts {
        self.evict(Instant::now());
        let failed = self.terminal.iter().filter(|(_, ok)| !ok).count();
        WindowCounts {
            succeeded: self.terminal.len() - failed,
            failed,
            retried: self.retried.len(),
        }
    }

    fn evict(&mut self, now: Instant) {
        let max_age = self.max_age;
        while self
            .terminal
            .front()
            .is_some_and(|(at, _)| now.duration_since(*at) > max_age)
        {
            self.terminal.pop_front();
        }
        while self
            .retried
            .front()
            .is_some_and(|at| now.duration_since(*at) > max_age)
        {
            self.retried.pop_front();
        }
    }
}
