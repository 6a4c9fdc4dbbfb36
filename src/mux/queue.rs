//! Bounded queue with a drop-oldest overflow policy.
//!
//! tokio's mpsc cannot evict from the sender side, so the fan-out queue
//! and each mux client's inbound queue use this small VecDeque + Notify
//! structure instead: pushing onto a full queue discards the oldest item
//! and reports it so the caller can count the loss. A single consumer
//! task drains the queue.

// Rust guideline compliant 2026-01

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

/// Bounded multi-producer, single-consumer queue, DropOldest on overflow.
pub struct DropOldestQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl<T> std::fmt::Debug for DropOldestQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DropOldestQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<T> DropOldestQueue<T> {
    /// Create a queue holding at most `capacity` items.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be > 0");
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue an item, evicting the oldest when full.
    ///
    /// Returns the number of items dropped (0 or 1). Pushing onto a closed
    /// queue drops the item itself and returns 1.
    pub fn push(&self, item: T) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 1;
        }
        let dropped = {
            let mut items = self.items.lock().expect("queue mutex poisoned");
            let dropped = if items.len() >= self.capacity {
                items.pop_front();
                1
            } else {
                0
            };
            items.push_back(item);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    /// Dequeue without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().expect("queue mutex poisoned").pop_front()
    }

    /// Dequeue, waiting for an item. Returns `None` once the queue is
    /// closed AND drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            // `Notify` stores a permit when nobody is waiting, so a push
            // between the check above and this await cannot be missed.
            self.notify.notified().await;
        }
    }

    /// Close the queue; the consumer drains what remains and then gets
    /// `None`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Current number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().expect("queue mutex poisoned").len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
