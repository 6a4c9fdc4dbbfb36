//! Synchronous listener fan-out with per-listener panic isolation.
//!
//! Listeners run synchronously on the emitter's task and must not block.
//! A panicking listener is caught and logged so one bad subscriber cannot
//! poison the fan-out for the rest.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Callback<E> = Box<dyn Fn(&E) + Send + Sync>;

/// A set of subscribed callbacks for events of type `E`.
pub struct Listeners<E> {
    next_id: AtomicU64,
    callbacks: Arc<Mutex<HashMap<u64, Arc<Callback<E>>>>>,
}

impl<E> std::fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.callbacks.lock().map(|m| m.len()).unwrap_or(0);
        f.debug_struct("Listeners").field("count", &count).finish()
    }
}

impl<E: 'static> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> Listeners<E> {
    /// Create an empty listener set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            callbacks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe a callback; dropping the returned handle unsubscribes.
    pub fn subscribe(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .lock()
            .expect("listener map poisoned")
            .insert(id, Arc::new(Box::new(callback)));

        let callbacks = Arc::clone(&self.callbacks);
        ListenerHandle {
            unsubscribe: Some(Box::new(move || {
                if let Ok(mut map) = callbacks.lock() {
                    map.remove(&id);
                }
            })),
        }
    }

    /// Invoke every listener synchronously, isolating panics.
    pub fn emit(&self, event: &E) {
        // Snapshot so a listener can (un)subscribe without deadlocking.
        let snapshot: Vec<Arc<Callback<E>>> = self
            .callbacks
            .lock()
            .expect("listener map poisoned")
            .values()
            .map(Arc::clone)
            .collect();

        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                log::error!("[listeners] listener panicked during emit; continuing fan-out");
            }
        }
    }

    /// Number of current subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.callbacks.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// True when nothing is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Subscription handle; dropping it removes the listener.
pub struct ListenerHandle {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle").finish_non_exhaustive()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_reaches_every_listener() {
        let listeners: Listeners<u32> = Listeners::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = Arc::clone(&count);
        let _h1 = listeners.subscribe(move |v| {
            c1.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let c2 = Arc::clone(&count);
        let _h2 = listeners.subscribe(move |v| {
            c2.fetch_add(*v as usize, Ordering::SeqCst);
        });

        listeners.emit(&5);
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_dropping_handle_unsubscribes() {
        let listeners: Listeners<()> = Listeners::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let handle = listeners.subscribe(move |_: &()| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        listeners.emit(&());
        assert_eq!(listeners.len(), 1);

        drop(handle);
        listeners.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_panicking_listener_does_not_poison_fanout() {
        let listeners: Listeners<()> = Listeners::new();
        let count = Arc::new(AtomicUsize::new(0));

        let _bad = listeners.subscribe(|_: &()| panic!("listener bug"));
        let c = Arc::clone(&count);
        let _good = listeners.subscribe(move |_: &()| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        listeners.emit(&());
        listeners.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
