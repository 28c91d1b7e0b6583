//! Priority admission queue
//!
//! Bounded buffer of admitted, not-yet-dispatched requests. Dequeue order is
//! priority descending, then admission order ascending (FIFO within a tier).
//! A full queue rejects immediately: that rejection is the backpressure
//! signal, callers are never blocked and nothing is dropped silently.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::Error;
use crate::operation::{Priority, RequestId};

type OrderKey = (Reverse<Priority>, u64);

/// Identifies one admission of a request. A retried request is admitted
/// again under a new ticket, so a stale ticket never matches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    /// Request id
    pub id: RequestId,
    seq: u64,
}

/// A push that was not admitted. The item is handed back to the caller.
#[derive(Debug)]
pub struct Rejected<T> {
    /// `QueueFull` or `Shutdown`
    pub error: Error,
    /// The item that was not admitted
    pub item: T,
}

struct QueueState<T> {
    entries: BTreeMap<OrderKey, (RequestId, T)>,
    index: HashMap<RequestId, OrderKey>,
    next_seq: u64,
    capacity: usize,
    closed: bool,
}

/// Bounded priority queue shared by submitters and the dispatcher
pub struct AdmissionQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T> AdmissionQueue<T> {
    /// Create a queue holding at most `capacity` entries
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: BTreeMap::new(),
                index: HashMap::new(),
                next_seq: 0,
                capacity,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Admit `item` or reject it without blocking.
    pub fn push(&self, id: RequestId, priority: Priority, item: T) -> Result<Ticket, Rejected<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Rejected {
                error: Error::Shutdown,
                item,
            });
        }
        if state.entries.len() >= state.capacity {
            let capacity = state.capacity;
            debug!(request_id = %id, capacity, "Queue full, rejecting");
            return Err(Rejected {
                error: Error::QueueFull { capacity },
                item,
            });
        }
        if state.index.contains_key(&id) {
            return Err(Rejected {
                error: Error::InvalidRequest(format!("request {id} is already queued")),
                item,
            });
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let key = (Reverse(priority), seq);
        state.entries.insert(key, (id, item));
        state.index.insert(id, key);
        let depth = state.entries.len();
        drop(state);

        trace!(request_id = %id, %priority, depth, "Request admitted");
        self.notify.notify_one();
        Ok(Ticket { id, seq })
    }

    /// Take the highest-priority, earliest-admitted entry.
    pub fn pop(&self) -> Option<(RequestId, T)> {
        let mut state = self.state.lock();
        let (_, (id, item)) = state.entries.pop_first()?;
        state.index.remove(&id);
        Some((id, item))
    }

    /// Wait until an entry is available and take it.
    ///
    /// Single consumer: only the dispatcher calls this.
    pub async fn pop_wait(&self) -> (RequestId, T) {
        loop {
            if let Some(entry) = self.pop() {
                return entry;
            }
            self.notify.notified().await;
        }
    }

    /// Remove the admission identified by `ticket`, if it is still queued.
    pub fn remove(&self, ticket: Ticket) -> Option<T> {
        let mut state = self.state.lock();
        let key = *state.index.get(&ticket.id)?;
        if key.1 != ticket.seq {
            return None;
        }
        state.index.remove(&ticket.id);
        state.entries.remove(&key).map(|(_, item)| item)
    }

    /// Mutate a still-queued entry in place. Returns `false` when the
    /// admission is no longer queued.
    pub fn update(&self, ticket: Ticket, f: impl FnOnce(&mut T)) -> bool {
        let mut state = self.state.lock();
        let Some(key) = state.index.get(&ticket.id).copied() else {
            return false;
        };
        if key.1 != ticket.seq {
            return false;
        }
        match state.entries.get_mut(&key) {
            Some((_, item)) => {
                f(item);
                true
            }
            None => false,
        }
    }

    /// Reject all further pushes and hand back everything still queued,
    /// in dequeue order.
    pub fn close(&self) -> Vec<T> {
        let mut state = self.state.lock();
        state.closed = true;
        state.index.clear();
        let entries = std::mem::take(&mut state.entries);
        drop(state);
        self.notify.notify_waiters();
        entries.into_values().map(|(_, item)| item).collect()
    }

    /// Current number of queued entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured maximum size
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    /// Change the maximum size. Entries already queued beyond a smaller
    /// capacity stay; new pushes are rejected until the queue drains below it.
    pub fn set_capacity(&self, capacity: usize) {
        self.state.lock().capacity = capacity;
    }

    /// Fraction of capacity in use (0.0-1.0)
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn utilization(&self) -> f64 {
        let state = self.state.lock();
        state.entries.len() as f64 / state.capacity as f64
    }
}
