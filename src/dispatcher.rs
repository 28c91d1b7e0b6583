//! Concurrency-limited dispatch
//!
//! One loop owns dispatch decisions. It waits for a free execution slot,
//! takes the next request from the admission queue, consults the breaker and
//! spawns the store call as its own task. Each request reaches exactly one
//! terminal outcome: whoever removes a [`Pending`] entry from the queue, the
//! backoff table or an execution task is the one that answers the caller.

use std::cmp::Ordering as Cmp;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::alert::{AlertEmitter, AlertKind};
use crate::breaker::CircuitBreaker;
use crate::config::Config;
use crate::metrics::{MetricsAggregator, Thresholds};
use crate::operation::{OperationRequest, OperationResult, RequestId};
use crate::queue::{AdmissionQueue, Rejected, Ticket};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::{self, Store};
use crate::timer::{Timer, TimerHandle};
use crate::{Error, Result};

/// A request together with the channel its caller is waiting on
pub(crate) struct Pending {
    pub(crate) request: OperationRequest,
    respond: oneshot::Sender<Result<OperationResult>>,
    /// Queue-wait deadline while queued, backoff timer while retry-pending
    timer: Option<TimerHandle>,
}

impl Pending {
    pub(crate) fn new(request: OperationRequest) -> (Self, oneshot::Receiver<Result<OperationResult>>) {
        let (respond, rx) = oneshot::channel();
        (
            Self {
                request,
                respond,
                timer: None,
            },
            rx,
        )
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }

    fn resolve(self, outcome: Result<OperationResult>) {
        if self.respond.send(outcome).is_err() {
            debug!(request_id = %self.request.id, "Caller went away before the result");
        }
    }
}

/// An occupied execution slot. Dropping it frees the slot, including when
/// the task holding it unwinds.
struct Slot {
    id: RequestId,
    executing: Arc<Mutex<HashSet<RequestId>>>,
    metrics: Arc<MetricsAggregator>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let executing = {
            let mut executing = self.executing.lock();
            executing.remove(&self.id);
            executing.len()
        };
        self.metrics.set_concurrency(executing);
    }
}

/// Shared dispatch state
pub(crate) struct Dispatcher {
    queue: AdmissionQueue<Pending>,
    store: Arc<dyn Store>,
    timer: Arc<dyn Timer>,
    metrics: Arc<MetricsAggregator>,
    breaker: CircuitBreaker,
    alerts: Arc<AlertEmitter>,
    retry: RwLock<RetryPolicy>,
    thresholds: RwLock<Thresholds>,
    slots: Arc<Semaphore>,
    max_concurrent: AtomicUsize,
    executing: Arc<Mutex<HashSet<RequestId>>>,
    backing_off: Mutex<HashMap<RequestId, Pending>>,
}

/// Collaborators a [`Dispatcher`] is assembled from
pub(crate) struct DispatcherParts {
    pub(crate) max_queue_size: usize,
    pub(crate) max_concurrent: usize,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) timer: Arc<dyn Timer>,
    pub(crate) metrics: Arc<MetricsAggregator>,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) alerts: Arc<AlertEmitter>,
    pub(crate) retry: RetryPolicy,
    pub(crate) thresholds: Thresholds,
}

impl Dispatcher {
    pub(crate) fn new(parts: DispatcherParts) -> Self {
        Self {
            queue: AdmissionQueue::new(parts.max_queue_size),
            store: parts.store,
            timer: parts.timer,
            metrics: parts.metrics,
            breaker: parts.breaker,
            alerts: parts.alerts,
            retry: RwLock::new(parts.retry),
            thresholds: RwLock::new(parts.thresholds),
            slots: Arc::new(Semaphore::new(parts.max_concurrent)),
            max_concurrent: AtomicUsize::new(parts.max_concurrent),
            executing: Arc::new(Mutex::new(HashSet::new())),
            backing_off: Mutex::new(HashMap::new()),
        }
    }

    /// Admit `request` and wait for its terminal outcome.
    pub(crate) async fn submit(self: &Arc<Self>, request: OperationRequest) -> Result<OperationResult> {
        let (pending, rx) = Pending::new(request);
        if let Err(Rejected { error, item }) = self.admit(pending) {
            self.conclude(item, Err(error), None, None, None);
        }
        rx.await.unwrap_or(Err(Error::Shutdown))
    }

    /// Push into the queue and arm the queue-wait deadline.
    fn admit(self: &Arc<Self>, pending: Pending) -> std::result::Result<(), Rejected<Pending>> {
        let id = pending.request.id;
        let priority = pending.request.priority;
        let queue_timeout = pending.request.queue_timeout;

        let ticket = self.queue.push(id, priority, pending)?;
        self.metrics.set_queue_depth(self.queue.len());

        let weak = Arc::downgrade(self);
        let admitted = Instant::now();
        let deadline = self.timer.schedule_once(
            queue_timeout,
            Box::pin(async move {
                if let Some(dispatcher) = weak.upgrade() {
                    dispatcher.expire(ticket, admitted);
                }
            }),
        );

        // Already dispatched (or expired) if the entry is gone.
        let mut deadline = Some(deadline);
        self.queue.update(ticket, |pending| pending.timer = deadline.take());
        if let Some(deadline) = deadline {
            deadline.cancel();
        }
        trace!(request_id = %id, %priority, "Request queued");
        Ok(())
    }

    fn expire(&self, ticket: Ticket, admitted: Instant) {
        let Some(mut pending) = self.queue.remove(ticket) else {
            return;
        };
        pending.timer = None;
        self.metrics.set_queue_depth(self.queue.len());

        let waited = admitted.elapsed();
        warn!(
            request_id = %ticket.id,
            waited_ms = waited.as_millis(),
            "Request timed out waiting in queue"
        );
        let queue_wait = pending.request.arrival().elapsed();
        self.conclude(pending, Err(Error::QueueTimeout { waited }), None, Some(queue_wait), None);
    }

    /// Dispatch loop. Returns once `shutdown` is cancelled.
    pub(crate) async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            max_concurrent = self.max_concurrent.load(Ordering::Relaxed),
            max_queue_size = self.queue.capacity(),
            "Dispatcher started"
        );

        loop {
            let permit = tokio::select! {
                () = shutdown.cancelled() => break,
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (id, mut pending) = tokio::select! {
                () = shutdown.cancelled() => break,
                entry = self.queue.pop_wait() => entry,
            };
            pending.cancel_timer();
            self.metrics.set_queue_depth(self.queue.len());

            if let Err(error) = self.breaker.check(&self.metrics, &self.alerts) {
                drop(permit);
                debug!(request_id = %id, "Circuit open, failing request without dispatch");
                let queue_wait = pending.request.arrival().elapsed();
                self.conclude(pending, Err(error), None, Some(queue_wait), None);
                continue;
            }

            let executing = {
                let mut executing = self.executing.lock();
                executing.insert(id);
                executing.len()
            };
            self.metrics.set_concurrency(executing);

            let slot = Slot {
                id,
                executing: Arc::clone(&self.executing),
                metrics: Arc::clone(&self.metrics),
                _permit: permit,
            };
            let dispatcher = Arc::clone(&self);
            tokio::spawn(async move {
                dispatcher.execute(pending, slot).await;
            });
        }

        info!("Dispatcher stopped");
    }

    async fn execute(self: Arc<Self>, mut pending: Pending, slot: Slot) {
        let request = &pending.request;
        let queue_wait = request.arrival().elapsed();
        let timeout = request.execution_timeout;
        debug!(
            request_id = %request.id,
            kind = %request.operation.kind,
            key = %request.operation.key,
            retry = request.retry_count(),
            "Executing operation"
        );

        // The store call runs in its own task so a panicking backend still
        // produces a terminal outcome for this request.
        let backend = Arc::clone(&self.store);
        let operation = request.operation.clone();
        let started = Instant::now();
        let call = tokio::spawn(async move {
            tokio::time::timeout(timeout, store::execute(backend.as_ref(), &operation)).await
        });
        let outcome = match call.await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(Error::Operation(e)),
            Ok(Err(_)) => Err(Error::ExecutionTimeout { timeout }),
            Err(e) => {
                error!(request_id = %request.id, error = %e, "Store call did not complete");
                Err(Error::Internal(format!("store call aborted: {e}")))
            }
        };
        let execution_time = started.elapsed();
        self.metrics.record_attempt(execution_time);

        let error = match outcome {
            Ok(value) => {
                let result = OperationResult {
                    request_id: request.id,
                    kind: request.operation.kind,
                    value,
                    execution_time,
                    queue_wait,
                    retry_count: request.retry_count(),
                };
                self.conclude(pending, Ok(result), Some(execution_time), Some(queue_wait), Some(slot));
                return;
            }
            Err(error) => error,
        };

        let decision = self.retry.read().decide(&mut pending.request, error);
        match decision {
            RetryDecision::Retry { delay, attempt } => {
                self.metrics.record_retry();
                drop(slot);
                info!(
                    request_id = %pending.request.id,
                    retry = attempt,
                    delay_ms = delay.as_millis(),
                    "Scheduling retry"
                );
                self.schedule_retry(pending, delay);
            }
            RetryDecision::GiveUp(error) => {
                self.conclude(pending, Err(error), Some(execution_time), Some(queue_wait), Some(slot));
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, pending: Pending, delay: Duration) {
        let id = pending.request.id;
        self.backing_off.lock().insert(id, pending);

        let weak: Weak<Self> = Arc::downgrade(self);
        let timer = self.timer.schedule_once(
            delay,
            Box::pin(async move {
                if let Some(dispatcher) = weak.upgrade() {
                    dispatcher.readmit(id);
                }
            }),
        );
        if let Some(pending) = self.backing_off.lock().get_mut(&id) {
            pending.timer = Some(timer);
        }
    }

    /// Backoff elapsed: queue the request again with a fresh wait window.
    fn readmit(self: &Arc<Self>, id: RequestId) {
        let Some(mut pending) = self.backing_off.lock().remove(&id) else {
            return;
        };
        // The timer running this call; dropping it does not abort.
        pending.timer = None;

        if let Err(Rejected { error, item }) = self.admit(pending) {
            warn!(request_id = %id, error = %error, "Retry could not be queued");
            let queue_wait = item.request.arrival().elapsed();
            self.conclude(item, Err(error), None, Some(queue_wait), None);
        }
    }

    /// Record the outcome, free the slot, then answer the caller.
    fn conclude(
        &self,
        pending: Pending,
        outcome: Result<OperationResult>,
        execution: Option<Duration>,
        queue_wait: Option<Duration>,
        slot: Option<Slot>,
    ) {
        match &outcome {
            Ok(result) => self.metrics.record_success(result.execution_time, result.queue_wait),
            Err(error) => self.metrics.record_failure(error, execution, queue_wait),
        }
        drop(slot);

        if let Err(error) = &outcome {
            let request = &pending.request;
            error!(
                request_id = %request.id,
                kind = %request.operation.kind,
                key = %request.operation.key,
                code = error.code(),
                error = %error,
                "KV operation failed"
            );
            self.alerts.emit(
                AlertKind::OperationFailed,
                json!({
                    "request_id": request.id.to_string(),
                    "operation": request.operation.kind.as_str(),
                    "key": request.operation.key,
                    "error": error.to_string(),
                    "code": error.code(),
                    "retry_count": request.retry_count(),
                }),
            );
        }

        pending.resolve(outcome);
        self.check_thresholds();
    }

    /// Raise threshold alerts for the current snapshot, subject to cooldown.
    pub(crate) fn check_thresholds(&self) {
        let snapshot = self.metrics.snapshot();
        let breaches = self.thresholds.read().breaches(&snapshot);
        for (kind, details) in breaches {
            self.alerts.emit_throttled(kind, details);
        }
    }

    /// Periodic refresh of gauges and threshold alerts.
    pub(crate) fn tick(&self) {
        self.metrics.set_queue_depth(self.queue.len());
        self.metrics.set_concurrency(self.executing_len());
        self.check_thresholds();
    }

    /// Stop admitting and fail everything still queued or backing off with
    /// [`Error::Shutdown`]. In-flight executions finish on their own.
    pub(crate) fn close(&self) -> usize {
        let queued = self.queue.close();
        let backing_off: Vec<Pending> = self.backing_off.lock().drain().map(|(_, p)| p).collect();
        self.metrics.set_queue_depth(0);

        let drained = queued.len() + backing_off.len();
        for mut pending in queued.into_iter().chain(backing_off) {
            pending.cancel_timer();
            let queue_wait = pending.request.arrival().elapsed();
            self.conclude(pending, Err(Error::Shutdown), None, Some(queue_wait), None);
        }
        drained
    }

    /// Apply the live-tunable parts of `config`: queue capacity, slot count,
    /// backoff, breaker gate and alert thresholds.
    pub(crate) fn reconfigure(&self, config: &Config) {
        self.queue.set_capacity(config.queue.max_queue_size);
        self.resize_slots(config.queue.max_concurrent_requests);
        *self.retry.write() = RetryPolicy::new(&config.retry);
        *self.thresholds.write() =
            Thresholds::new(&config.breaker, &config.alerts, config.queue.max_queue_size);
        self.breaker.reconfigure(&config.breaker);
        self.alerts.set_cooldown(config.alerts.cooldown);
        self.check_thresholds();
    }

    fn resize_slots(&self, max_concurrent: usize) {
        let previous = self.max_concurrent.swap(max_concurrent, Ordering::SeqCst);
        match max_concurrent.cmp(&previous) {
            Cmp::Greater => self.slots.add_permits(max_concurrent - previous),
            Cmp::Less => {
                // Busy slots are retired as their operations finish. Dispatch
                // waits behind this acquisition.
                let surplus = u32::try_from(previous - max_concurrent).unwrap_or(u32::MAX);
                let slots = Arc::clone(&self.slots);
                tokio::spawn(async move {
                    if let Ok(permits) = slots.acquire_many_owned(surplus).await {
                        permits.forget();
                    }
                });
            }
            Cmp::Equal => return,
        }
        info!(previous, max_concurrent, "Concurrency limit changed");
    }

    /// Resolves once no operation holds an execution slot.
    pub(crate) async fn wait_idle(&self) {
        let max_concurrent = self.max_concurrent.load(Ordering::SeqCst);
        let all = u32::try_from(max_concurrent).unwrap_or(u32::MAX);
        if let Ok(permits) = self.slots.acquire_many(all).await {
            drop(permits);
        }
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn executing_len(&self) -> usize {
        self.executing.lock().len()
    }

    pub(crate) fn backing_off_len(&self) -> usize {
        self.backing_off.lock().len()
    }

    pub(crate) fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}
