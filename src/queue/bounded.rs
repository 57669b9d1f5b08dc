use std::{
    collections::VecDeque,
    fmt,
    sync::{Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// What a full queue does with one more item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum OverflowPolicy {
    /// Evict the single oldest pending item and accept the new one.
    DropOldest,
    /// Park the producer until a consumer frees a slot.
    Block,
}

/// Result of a successful push.
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome<T> {
    Accepted,
    /// The item was accepted and this, the oldest pending item, was evicted to make room.
    Evicted(T),
}

/// Returned by `push` once the queue has been closed; hands the item back.
pub struct QueueClosed<T>(pub T);

impl<T> fmt::Debug for QueueClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueClosed(..)")
    }
}

impl<T> fmt::Display for QueueClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue is closed")
    }
}

impl<T> std::error::Error for QueueClosed<T> {}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub depth: usize,
    pub capacity: usize,
    pub accepted: u64,
    pub dropped: u64,
    pub delivered: u64,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
    accepted: u64,
    dropped: u64,
    delivered: u64,
}

/// Fixed-capacity async FIFO shared between pipeline stages.
///
/// The lock is never held across an await point; waiting happens on the two
/// `Notify` handles. `pop` is cancel-safe: an item leaves the queue only in the
/// same poll that returns it.
pub struct BoundedQueue<T> {
    name: &'static str,
    capacity: usize,
    policy: OverflowPolicy,
    inner: Mutex<Inner<T>>,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> BoundedQueue<T> {
    pub fn new(name: &'static str, capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            policy,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                accepted: 0,
                dropped: 0,
                delivered: 0,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.lock();
        QueueStats {
            depth: inner.items.len(),
            capacity: self.capacity,
            accepted: inner.accepted,
            dropped: inner.dropped,
            delivered: inner.delivered,
        }
    }

    /// Enqueue `item`. Never waits under `DropOldest`; waits for space under `Block`.
    pub async fn push(&self, item: T) -> Result<PushOutcome<T>, QueueClosed<T>> {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.closed {
                    return Err(QueueClosed(item));
                }

                if inner.items.len() < self.capacity {
                    inner.items.push_back(item);
                    inner.accepted += 1;
                    drop(inner);
                    self.not_empty.notify_one();
                    return Ok(PushOutcome::Accepted);
                }

                if self.policy == OverflowPolicy::DropOldest {
                    let evicted = inner.items.pop_front();
                    inner.items.push_back(item);
                    inner.accepted += 1;
                    inner.dropped += 1;
                    drop(inner);
                    self.not_empty.notify_one();
                    return Ok(match evicted {
                        Some(old) => PushOutcome::Evicted(old),
                        None => PushOutcome::Accepted,
                    });
                }
            }

            notified.await;
        }
    }

    /// Dequeue the oldest item, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    inner.delivered += 1;
                    drop(inner);
                    self.not_full.notify_one();
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Stop accepting items. Pending items stay poppable.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Remove and return everything still pending, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let drained: Vec<T> = {
            let mut inner = self.lock();
            inner.items.drain(..).collect()
        };
        if !drained.is_empty() {
            self.not_full.notify_waiters();
        }
        drained
    }
}
