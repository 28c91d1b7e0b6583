//! Timer capability for backoff delays, queue-wait deadlines and periodic
//! tasks.
//!
//! The queue never calls `tokio::time` directly for scheduling; it goes
//! through a [`Timer`] so hosts can substitute their own alarm mechanism.
//! [`TokioTimer`] is the default. Tests drive it with tokio's paused clock.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::AbortHandle;

/// Repeating task body
pub type RepeatingTask = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle to a scheduled task
#[derive(Debug)]
pub struct TimerHandle {
    abort: AbortHandle,
}

impl TimerHandle {
    /// Wrap an abort handle
    #[must_use]
    pub fn new(abort: AbortHandle) -> Self {
        Self { abort }
    }

    /// Cancel the task if it has not run yet. Dropping a handle does not cancel.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    /// Whether the task has completed or been cancelled
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// Schedule-once / schedule-repeating capability
pub trait Timer: Send + Sync + 'static {
    /// Run `task` once after `delay`.
    fn schedule_once(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TimerHandle;

    /// Run `task` every `interval`, first run one interval from now. A run
    /// that overlaps the next tick delays it rather than running in parallel.
    fn schedule_repeating(&self, interval: Duration, task: RepeatingTask) -> TimerHandle;
}

/// [`Timer`] backed by the tokio runtime
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn schedule_once(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TimerHandle {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        TimerHandle::new(handle.abort_handle())
    }

    fn schedule_repeating(&self, interval: Duration, task: RepeatingTask) -> TimerHandle {
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                task().await;
            }
        });
        TimerHandle::new(handle.abort_handle())
    }
}
