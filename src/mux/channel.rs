//! Logical channel: one multiplexed sub-stream.
//!
//! A [`Channel`] is scoped to the connection that created it and to an
//! identifier unique within that connection's lifetime. Its state machine
//! is a single directed transition, Open → Closed, triggered by a local
//! close call, an inbound close/error frame, or teardown of the owning
//! connection. The transition fires the close event exactly once.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::events::EventHub;
use crate::identifiers::{ChannelId, SubscriptionId};
use crate::protocol::Frame;
use crate::race::{branch, race};

use super::connection::Shared;

// ============================================================================
// CloseReason
// ============================================================================

/// Why a channel reached its terminal state.
///
/// Delivered on the channel's close event; conceptually the sum of
/// graceful closure and error closure, plus the forced variant when the
/// whole connection goes away.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// The owning connection closed; every channel is force-closed.
    Connection,

    /// Graceful termination via a `close` frame or a local close call,
    /// optionally carrying a final payload.
    Closed(Option<Value>),

    /// Abnormal termination via an `error` frame or a failed path handler.
    Error(String),
}

// ============================================================================
// ChannelEvents
// ============================================================================

/// Per-channel event state, stored in the connection's channel table.
///
/// Shared between the table entry and every [`Channel`] handle so that
/// inbound dispatch and application code observe the same one-shot close.
pub(crate) struct ChannelEvents {
    /// Payloads delivered while the channel is open.
    pub(crate) message: EventHub<Value>,
    /// Terminal close event.
    pub(crate) close: EventHub<CloseReason>,
    /// Payloads that arrived before any listener attached.
    backlog: Mutex<VecDeque<Value>>,
    /// One-shot close latch.
    closed: AtomicBool,
    /// Reason recorded at close time, for late observers.
    reason: Mutex<Option<CloseReason>>,
}

impl ChannelEvents {
    pub(crate) fn new() -> Self {
        Self {
            message: EventHub::new(),
            close: EventHub::new(),
            backlog: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }

    /// Delivers an inbound payload to the message hub.
    ///
    /// A payload arriving while no listener is attached is parked, in
    /// order, and replayed to the first listener (or popped by a pending
    /// [`Channel::final_response`]); an early reply never slips past a
    /// late subscriber.
    pub(crate) fn deliver(&self, value: Value) {
        let mut backlog = self.backlog.lock();
        if self.message.listener_count() == 0 {
            backlog.push_back(value);
            return;
        }
        drop(backlog);
        self.message.publish(&value);
    }

    /// Attaches a message listener, replaying any parked payloads first.
    ///
    /// The drain and the subscription happen under the backlog lock, so
    /// a concurrent [`deliver`](Self::deliver) either parks before the
    /// drain or publishes to the fresh subscription.
    pub(crate) fn subscribe_messages(
        &self,
        listener: impl Fn(&Value) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut backlog = self.backlog.lock();
        for value in backlog.drain(..) {
            listener(&value);
        }
        self.message.subscribe(listener)
    }

    /// Pops the oldest parked payload, if any.
    pub(crate) fn pop_backlog(&self) -> Option<Value> {
        self.backlog.lock().pop_front()
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns the close reason if the channel has already closed.
    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        self.reason.lock().clone()
    }

    /// Performs the Open → Closed transition.
    ///
    /// The reason is recorded before the close event is published, so a
    /// waiter registering concurrently either receives the event or finds
    /// the recorded reason. Subsequent calls are no-ops.
    pub(crate) fn fire_close(&self, reason: &CloseReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.reason.lock() = Some(reason.clone());
        self.close.publish(reason);
    }
}

// ============================================================================
// Channel
// ============================================================================

/// One logical sub-stream multiplexed over a [`Connection`](super::Connection).
///
/// Cloning yields another handle to the same channel. All handles share
/// the Open → Closed state.
pub struct Channel {
    id: ChannelId,
    shared: Arc<Shared>,
    events: Arc<ChannelEvents>,
}

impl Clone for Channel {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            shared: Arc::clone(&self.shared),
            events: Arc::clone(&self.events),
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("closed", &self.events.is_closed())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(id: ChannelId, shared: Arc<Shared>, events: Arc<ChannelEvents>) -> Self {
        Self { id, shared, events }
    }

    /// Returns this channel's identifier.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Returns `true` once the channel has reached its terminal state.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    /// Registers a listener for payloads delivered on this channel.
    ///
    /// Payloads that arrived before any listener attached are parked and
    /// replayed to the first listener, in arrival order, so subscribing
    /// after [`Connection::open`](super::Connection::open) returns cannot
    /// miss a fast peer's reply.
    pub fn on_message(&self, listener: impl Fn(&Value) + Send + Sync + 'static) -> SubscriptionId {
        self.events.subscribe_messages(listener)
    }

    /// Removes a message listener; returns `false` if absent.
    pub fn off_message(&self, id: SubscriptionId) -> bool {
        self.events.message.unsubscribe(id)
    }

    /// Hub for the terminal close event.
    ///
    /// Fires exactly once, carrying the [`CloseReason`].
    #[must_use]
    pub fn close_events(&self) -> EventHub<CloseReason> {
        self.events.close.clone()
    }

    /// Sends a payload on this channel.
    ///
    /// # Errors
    ///
    /// - [`Error::ChannelClosed`] if the channel already closed
    /// - [`Error::ConnectionClosed`] if the owning connection is gone
    pub async fn send(&self, data: Value) -> Result<()> {
        if self.events.is_closed() {
            return Err(Error::channel_closed(self.id));
        }
        self.shared
            .send(Frame::Data {
                id: self.id,
                data: Some(data),
            })
            .await
    }

    /// Closes the channel gracefully, optionally carrying a final payload.
    ///
    /// Emits a `close` frame to the peer (best effort if the connection is
    /// already gone), fires the local close event and deregisters from the
    /// connection's table. Idempotent: a second call emits nothing.
    pub async fn close(&self, data: Option<Value>) {
        if self.events.is_closed() {
            return;
        }

        self.shared.remove_channel(self.id);

        let frame = Frame::Close {
            id: self.id,
            data: data.clone(),
        };
        if let Err(e) = self.shared.send(frame).await {
            debug!(channel = %self.id, error = %e, "Close frame not delivered");
        }

        self.events.fire_close(&CloseReason::Closed(data));
    }

    /// Closes the channel abnormally with a reason string.
    ///
    /// Emits an `error` frame to the peer; otherwise behaves like
    /// [`close`](Self::close).
    pub async fn close_with_error(&self, reason: impl Into<String>) {
        if self.events.is_closed() {
            return;
        }
        let reason = reason.into();

        self.shared.remove_channel(self.id);

        let frame = Frame::Error {
            id: self.id,
            reason: reason.clone(),
        };
        if let Err(e) = self.shared.send(frame).await {
            debug!(channel = %self.id, error = %e, "Error frame not delivered");
        }

        self.events.fire_close(&CloseReason::Error(reason));
    }

    /// Awaits this channel's terminal outcome within `deadline`.
    ///
    /// Settles with the first of: a delivered message (its payload), a
    /// graceful close (its final payload, or null), or an error close
    /// (fails with [`Error::ChannelError`]). A `deadline` of
    /// [`Duration::ZERO`] waits indefinitely, bounded only by channel or
    /// connection closure.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if the deadline elapses first; the channel is
    ///   left open and registered
    /// - [`Error::ChannelError`] on an error close
    /// - [`Error::ConnectionClosed`] if the owning connection closed
    pub async fn final_response(&self, deadline: Duration) -> Result<Value> {
        let message = self.events.message.watch();
        let close = self.events.close.watch();

        // Delivery that raced our registration is still visible here:
        // payloads park until a listener attaches, and the close reason
        // is recorded before the close event publishes.
        if let Some(parked) = self.events.pop_backlog() {
            return Ok(parked);
        }
        if let Some(reason) = self.events.close_reason() {
            return Self::settle(reason);
        }

        let (_label, outcome) = race(
            "final response",
            vec![
                branch("message", async move {
                    FinalOutcome::Message(message.wait().await)
                }),
                branch("close", async move {
                    FinalOutcome::Close(close.wait().await)
                }),
            ],
            deadline,
        )
        .await?;

        match outcome {
            FinalOutcome::Message(Some(data)) => Ok(data),
            FinalOutcome::Close(Some(reason)) => Self::settle(reason),
            // Hub vanished without delivering; only possible at teardown.
            FinalOutcome::Message(None) | FinalOutcome::Close(None) => {
                Err(Error::ConnectionClosed)
            }
        }
    }

    /// Maps a recorded close reason into the terminal result.
    fn settle(reason: CloseReason) -> Result<Value> {
        match reason {
            CloseReason::Closed(data) => Ok(data.unwrap_or(Value::Null)),
            CloseReason::Error(reason) => Err(Error::channel_error(reason)),
            CloseReason::Connection => Err(Error::ConnectionClosed),
        }
    }
}

/// Alternatives racing inside [`Channel::final_response`].
enum FinalOutcome {
    Message(Option<Value>),
    Close(Option<CloseReason>),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fire_close_once() {
        let events = ChannelEvents::new();
        let hits = Arc::new(AtomicBool::new(false));

        let hits_clone = Arc::clone(&hits);
        events.close.subscribe(move |_| {
            assert!(!hits_clone.swap(true, Ordering::SeqCst), "fired twice");
        });

        events.fire_close(&CloseReason::Closed(None));
        events.fire_close(&CloseReason::Error("late".to_string()));

        assert!(hits.load(Ordering::SeqCst));
        assert!(events.is_closed());
        // First reason wins.
        assert_eq!(events.close_reason(), Some(CloseReason::Closed(None)));
    }

    #[test]
    fn test_early_payloads_park_until_first_listener() {
        let events = ChannelEvents::new();

        events.deliver(Value::from(1));
        events.deliver(Value::from(2));

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        events.subscribe_messages(move |value: &Value| {
            sink.lock().push(value.clone());
        });

        // Parked payloads replay in arrival order; later deliveries go
        // straight to the listener.
        events.deliver(Value::from(3));
        assert_eq!(
            *seen.lock(),
            vec![Value::from(1), Value::from(2), Value::from(3)]
        );
        assert!(events.pop_backlog().is_none());
    }

    #[test]
    fn test_pop_backlog_takes_oldest() {
        let events = ChannelEvents::new();

        events.deliver(Value::from("first"));
        events.deliver(Value::from("second"));

        assert_eq!(events.pop_backlog(), Some(Value::from("first")));
        assert_eq!(events.pop_backlog(), Some(Value::from("second")));
        assert_eq!(events.pop_backlog(), None);
    }

    #[test]
    fn test_settle_variants() {
        let ok = Channel::settle(CloseReason::Closed(Some(Value::from(3))));
        assert_eq!(ok.expect("graceful close settles"), Value::from(3));

        let null = Channel::settle(CloseReason::Closed(None));
        assert_eq!(null.expect("empty close settles"), Value::Null);

        let err = Channel::settle(CloseReason::Error("boom".to_string()));
        assert!(matches!(err, Err(Error::ChannelError { .. })));

        let gone = Channel::settle(CloseReason::Connection);
        assert!(matches!(gone, Err(Error::ConnectionClosed)));
    }
}
