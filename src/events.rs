//! Event fan-out primitive.
//!
//! [`EventHub`] is the notification mechanism used for every event surface
//! in the crate: connection lifecycle events, per-channel message/close
//! events. Semantics are deliberately explicit:
//!
//! - Listeners fire synchronously, in registration order.
//! - The listener list is snapshotted before a publish, so listeners may
//!   subscribe or unsubscribe from inside a callback without deadlocking.
//! - [`EventHub::watch`] turns one future event into an awaitable; dropping
//!   the returned [`EventWaiter`] retracts the subscription, so losing
//!   branches of a race leave nothing attached.
//!
//! Listeners must not block: they run on the connection's delivery task.
//! Spawn a task for anything that suspends.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::identifiers::SubscriptionId;

// ============================================================================
// Types
// ============================================================================

/// Boxed listener callback.
type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

// ============================================================================
// EventHub
// ============================================================================

/// Multi-listener event hub for one event kind.
///
/// Cloning is cheap and yields a handle to the same hub.
pub struct EventHub<T> {
    listeners: Arc<Mutex<Vec<(SubscriptionId, Listener<T>)>>>,
}

impl<T> Clone for EventHub<T> {
    fn clone(&self) -> Self {
        Self {
            listeners: Arc::clone(&self.listeners),
        }
    }
}

impl<T> Default for EventHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventHub<T> {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Registers a listener; returns a token for [`unsubscribe`](Self::unsubscribe).
    ///
    /// Listeners are invoked in registration order.
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener; returns `false` if the token was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(sub, _)| *sub != id);
        listeners.len() != before
    }

    /// Delivers `value` to every listener, in registration order.
    ///
    /// The fan-out is synchronous: when this returns, every listener that
    /// was registered at publish time has run.
    pub fn publish(&self, value: &T) {
        let snapshot: Vec<Listener<T>> = {
            let listeners = self.listeners.lock();
            listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };

        for listener in snapshot {
            listener(value);
        }
    }

    /// Returns the number of registered listeners.
    #[inline]
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl<T: Clone + Send + 'static> EventHub<T> {
    /// Returns a one-shot awaitable for the next published value.
    ///
    /// Dropping the waiter before the event fires retracts the underlying
    /// subscription.
    #[must_use]
    pub fn watch(&self) -> EventWaiter<T> {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));

        let id = self.subscribe(move |value: &T| {
            if let Some(tx) = slot.lock().take() {
                let _ = tx.send(value.clone());
            }
        });

        EventWaiter {
            hub: self.clone(),
            id,
            rx,
        }
    }
}

// ============================================================================
// EventWaiter
// ============================================================================

/// One-shot subscription to an [`EventHub`].
///
/// Resolves with the first value published after creation. The
/// subscription is retracted when the waiter resolves or is dropped.
pub struct EventWaiter<T> {
    hub: EventHub<T>,
    id: SubscriptionId,
    rx: oneshot::Receiver<T>,
}

impl<T> EventWaiter<T> {
    /// Waits for the next published value.
    ///
    /// Returns `None` only if the hub delivered nothing and every sender
    /// side vanished, which cannot happen while the hub is alive; callers
    /// treat it as "never resolves".
    pub async fn wait(mut self) -> Option<T> {
        (&mut self.rx).await.ok()
    }
}

impl<T> Drop for EventWaiter<T> {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_publish_registration_order() {
        let hub: EventHub<u32> = EventHub::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            hub.subscribe(move |_| order.lock().push(tag));
        }

        hub.publish(&1);
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_unsubscribe() {
        let hub: EventHub<u32> = EventHub::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let id = hub.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        hub.publish(&1);
        assert!(hub.unsubscribe(id));
        hub.publish(&2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!hub.unsubscribe(id));
    }

    #[test]
    fn test_reentrant_unsubscribe_does_not_deadlock() {
        let hub: EventHub<u32> = EventHub::new();

        let hub_clone = hub.clone();
        let id_slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let slot_clone = Arc::clone(&id_slot);

        let id = hub.subscribe(move |_| {
            // Listener removes itself mid-publish.
            if let Some(id) = slot_clone.lock().take() {
                hub_clone.unsubscribe(id);
            }
        });
        *id_slot.lock() = Some(id);

        hub.publish(&1);
        assert_eq!(hub.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_watch_resolves_with_next_value() {
        let hub: EventHub<String> = EventHub::new();
        let waiter = hub.watch();

        hub.publish(&"hello".to_string());
        assert_eq!(waiter.wait().await.as_deref(), Some("hello"));

        // Subscription retracted after resolution.
        assert_eq!(hub.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_waiter_retracts_subscription() {
        let hub: EventHub<u32> = EventHub::new();

        let waiter = hub.watch();
        assert_eq!(hub.listener_count(), 1);

        drop(waiter);
        assert_eq!(hub.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_watch_sees_only_first_value() {
        let hub: EventHub<u32> = EventHub::new();
        let waiter = hub.watch();

        hub.publish(&1);
        hub.publish(&2);

        assert_eq!(waiter.wait().await, Some(1));
    }
}
