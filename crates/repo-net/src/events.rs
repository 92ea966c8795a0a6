//! Typed event streams.
//!
//! Every component in this crate publishes its events through an `EventBus<E>`:
//! adapters publish `AdapterEvent`s, the network subsystem publishes
//! `NetworkEvent`s, documents publish `DocEvent`s, and so on. Subscribers
//! register a callback and hold on to the returned `Subscription`; dropping it
//! unsubscribes.
//!
//! Callbacks run synchronously on the emitting thread, in subscription order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

type Callback<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription<E> {
    bus: Weak<EventBus<E>>,
    id: usize,
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus for publishing events to subscribers.
///
/// Thread-safe for use in multi-threaded Tokio runtime.
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus<E> {
    callbacks: RwLock<Vec<(usize, Callback<E>)>>,
    next_id: AtomicUsize,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(E) + Send + Sync + 'static,
    ) -> Subscription<E> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: E) {
        // Clone the callback list so callbacks may subscribe or unsubscribe.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    /// Remove every subscriber.
    pub fn clear(&self) {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl<E> EventBus<E> {
    fn unsubscribe(&self, id: usize) {
        // `emit` releases the read lock before running callbacks, so this
        // never waits on the dropping thread itself.
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }
}
