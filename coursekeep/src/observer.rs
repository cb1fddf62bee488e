//! Listener registry with per-listener failure isolation.
//!
//! Each dispatch iterates the registered listeners in subscription order. A
//! listener that panics is logged and skipped; the remaining listeners still
//! receive the event.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

/// Handle returned by [`ListenerRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A listener callback.
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Registry of listeners for events of type `E`.
pub struct ListenerRegistry<E> {
    listeners: RwLock<Vec<(ListenerId, Listener<E>)>>,
    next_id: AtomicU64,
}

impl<E> ListenerRegistry<E> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener and return its handle.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver an event to every listener.
    ///
    /// The listener list is snapshotted first, so a listener may subscribe or
    /// unsubscribe from inside its callback. Returns the number of listeners
    /// that failed.
    pub fn dispatch(&self, event: &E) -> usize {
        let snapshot: Vec<(ListenerId, Listener<E>)> = self.listeners.read().clone();
        let mut failures = 0;

        for (id, listener) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                failures += 1;
                warn!(listener = id.0, "Listener panicked during dispatch");
            }
        }

        failures
    }
}

impl<E> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for ListenerRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_dispatch_reaches_all_listeners_in_order() {
        let registry = ListenerRegistry::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            registry.subscribe(move |v: &u32| seen.lock().push(format!("{}{}", tag, v)));
        }

        assert_eq!(registry.dispatch(&7), 0);
        assert_eq!(*seen.lock(), vec!["a7".to_string(), "b7".to_string()]);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let registry = ListenerRegistry::<bool>::new();
        let hits = Arc::new(Mutex::new(0));

        registry.subscribe(|_| panic!("faulty subscriber"));
        let hits_clone = Arc::clone(&hits);
        registry.subscribe(move |_| *hits_clone.lock() += 1);

        let failures = registry.dispatch(&true);

        assert_eq!(failures, 1);
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let registry = ListenerRegistry::<()>::new();
        let id = registry.subscribe(|_| {});
        assert_eq!(registry.len(), 1);

        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        assert!(registry.is_empty());
    }
}
