//! Path registry: named endpoints for inbound channel opens.
//!
//! Two kinds of interest can attach to a path:
//!
//! - Persistent handlers, registered with [`PathRegistry::register`].
//!   A path may carry several; all are invoked, in registration order.
//! - One-shot waiters, created by
//!   [`Connection::wait_for_path`](super::Connection::wait_for_path).
//!   Waiters on a path form a FIFO queue; each inbound open satisfies at
//!   most one.
//!
//! Handler failures are funneled into the affected channel's error-close
//! path and never escalate to the connection or to unrelated channels.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::Result;
use crate::identifiers::{RegistrationId, SubscriptionId};

use super::channel::Channel;

// ============================================================================
// Types
// ============================================================================

/// Handler invoked for each channel opened against a path.
///
/// Receives the freshly registered channel and the open frame's initial
/// payload. Returning an error closes that channel with the error's
/// description as the reason.
pub type PathHandler =
    Arc<dyn Fn(Channel, Option<Value>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Waiter delivery payload: the opened channel plus initial data.
type OpenDelivery = (Channel, Option<Value>);

// ============================================================================
// PathRegistry
// ============================================================================

/// Mapping from path name to the code handling freshly opened channels.
///
/// Cloning is cheap and yields a handle to the same registry.
pub(crate) struct PathRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    handlers: Mutex<FxHashMap<String, Vec<(RegistrationId, PathHandler)>>>,
    waiters: Mutex<FxHashMap<String, VecDeque<(SubscriptionId, oneshot::Sender<OpenDelivery>)>>>,
}

impl Clone for PathRegistry {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl PathRegistry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                handlers: Mutex::new(FxHashMap::default()),
                waiters: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    /// Installs a handler on `path`.
    ///
    /// Registering twice on the same path adds a second independent
    /// handler; both are invoked for every open.
    pub(crate) fn register(&self, path: &str, handler: PathHandler) -> RegistrationId {
        let id = RegistrationId::next();
        self.inner
            .handlers
            .lock()
            .entry(path.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    /// Removes one handler from `path`; returns `false` if absent.
    pub(crate) fn unregister(&self, path: &str, id: RegistrationId) -> bool {
        let mut handlers = self.inner.handlers.lock();
        let Some(list) = handlers.get_mut(path) else {
            return false;
        };
        let before = list.len();
        list.retain(|(reg, _)| *reg != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(path);
        }
        removed
    }

    /// Returns the number of handlers registered on `path`.
    #[cfg(test)]
    pub(crate) fn handler_count(&self, path: &str) -> usize {
        self.inner
            .handlers
            .lock()
            .get(path)
            .map_or(0, |list| list.len())
    }

    /// Enqueues a one-shot waiter for the next open on `path`.
    ///
    /// Dropping the returned waiter retracts it from the queue.
    pub(crate) fn wait(&self, path: &str) -> PathWaiter {
        let id = SubscriptionId::next();
        let (tx, rx) = oneshot::channel();
        self.inner
            .waiters
            .lock()
            .entry(path.to_string())
            .or_default()
            .push_back((id, tx));

        PathWaiter {
            registry: self.clone(),
            path: path.to_string(),
            id,
            rx,
        }
    }

    /// Delivers a freshly opened channel to the interested parties.
    ///
    /// The oldest live waiter (if any) is satisfied first; every
    /// persistent handler is then invoked on its own task so one handler
    /// cannot block delivery to other channels. A handler returning an
    /// error closes the channel with that error as the reason.
    pub(crate) fn dispatch(&self, path: &str, channel: Channel, data: Option<Value>) {
        let mut delivered = false;
        {
            let mut waiters = self.inner.waiters.lock();
            if let Some(queue) = waiters.get_mut(path) {
                // Skip waiters whose receivers were dropped (lost races).
                while let Some((_, tx)) = queue.pop_front() {
                    if tx.send((channel.clone(), data.clone())).is_ok() {
                        delivered = true;
                        break;
                    }
                }
                if queue.is_empty() {
                    waiters.remove(path);
                }
            }
        }

        let handlers: Vec<PathHandler> = self
            .inner
            .handlers
            .lock()
            .get(path)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        if !delivered && handlers.is_empty() {
            warn!(path, channel = %channel.id(), "No handler registered for path");
            return;
        }

        for handler in handlers {
            let channel = channel.clone();
            let data = data.clone();
            tokio::spawn(async move {
                if let Err(e) = handler(channel.clone(), data).await {
                    warn!(channel = %channel.id(), error = %e, "Path handler failed");
                    channel.close_with_error(e.to_string()).await;
                }
            });
        }
    }

    /// Drops every queued waiter, failing their pending waits.
    ///
    /// Called at connection teardown.
    pub(crate) fn fail_waiters(&self) {
        let drained: Vec<_> = self.inner.waiters.lock().drain().collect();
        let count: usize = drained.iter().map(|(_, q)| q.len()).sum();
        if count > 0 {
            debug!(count, "Failed path waiters at teardown");
        }
    }

    fn retract_waiter(&self, path: &str, id: SubscriptionId) {
        let mut waiters = self.inner.waiters.lock();
        if let Some(queue) = waiters.get_mut(path) {
            queue.retain(|(sub, _)| *sub != id);
            if queue.is_empty() {
                waiters.remove(path);
            }
        }
    }
}

// ============================================================================
// PathWaiter
// ============================================================================

/// One-shot wait for the next open on a path.
///
/// Retracted from the queue when resolved or dropped.
pub(crate) struct PathWaiter {
    registry: PathRegistry,
    path: String,
    id: SubscriptionId,
    rx: oneshot::Receiver<OpenDelivery>,
}

impl PathWaiter {
    /// Waits for the next open; `None` means the connection tore down.
    pub(crate) async fn wait(mut self) -> Option<OpenDelivery> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for PathWaiter {
    fn drop(&mut self) {
        self.registry.retract_waiter(&self.path, self.id);
    }
}

// ============================================================================
// Tests
// ============================================================================
