//! Multiplexed connection and its delivery loop.
//!
//! A [`Connection`] wraps one WebSocket and owns the channel table. The
//! delivery loop is a spawned tokio task that handles:
//!
//! - Inbound frames: decode, then route by channel identifier (`open`
//!   frames go to the path registry, the rest to the addressed channel)
//! - Outbound frames from channel handles and the connection API
//! - Connection teardown: force-closing every channel before the
//!   connection's own close event fires
//!
//! Frames are processed one at a time in transport arrival order, so a
//! given channel observes its messages in order. Path handlers run on
//! their own tasks and cannot stall the loop.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::events::EventHub;
use crate::identifiers::{ChannelId, RegistrationId};
use crate::protocol::Frame;
use crate::race::{branch, race};

use super::channel::{Channel, ChannelEvents, CloseReason};
use super::registry::PathRegistry;

// ============================================================================
// Constants
// ============================================================================

/// Default deadline for [`Connection::request`] (1000 ms per protocol).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(1000);

/// Bounded retries for identifier allocation; collisions are effectively
/// impossible, the bound is defensive.
const MAX_ID_ATTEMPTS: usize = 16;

/// Normal closure status code.
const CLOSE_NORMAL: u16 = 1000;

/// Protocol error status code, sent when a violation closes the connection.
const CLOSE_PROTOCOL: u16 = 1002;

/// Abnormal closure status code, recorded locally on transport failure.
const CLOSE_ABNORMAL: u16 = 1006;

// ============================================================================
// ConnectionClose
// ============================================================================

/// Payload of the connection's close event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionClose {
    /// WebSocket status code (1000 = normal closure).
    pub code: u16,
    /// Human-readable reason, possibly empty.
    pub reason: String,
}

// ============================================================================
// Command
// ============================================================================

/// Internal commands for the delivery loop.
enum Command {
    /// Serialize and transmit one frame, acknowledging the result.
    Send {
        frame: Frame,
        done: oneshot::Sender<Result<()>>,
    },
    /// Transmit a close frame and stop the loop.
    Close { code: u16, reason: String },
}

// ============================================================================
// Shared
// ============================================================================

/// State shared between the delivery loop and every handle.
pub(crate) struct Shared {
    /// Channel into the delivery loop.
    command_tx: mpsc::UnboundedSender<Command>,
    /// Channel table: identifier → per-channel event state.
    channels: Mutex<FxHashMap<ChannelId, Arc<ChannelEvents>>>,
    /// Path name → handlers and one-shot waiters.
    registry: PathRegistry,
    /// Connection-level event hubs.
    events: ConnectionEvents,
    /// Set once the connection is closed or closing; no further sends.
    closed: AtomicBool,
}

/// Connection-lifecycle event hubs.
struct ConnectionEvents {
    open: EventHub<()>,
    message: EventHub<String>,
    error: EventHub<String>,
    ping: EventHub<Vec<u8>>,
    pong: EventHub<Vec<u8>>,
    close: EventHub<ConnectionClose>,
}

impl Shared {
    /// Serializes and transmits one frame via the delivery loop.
    pub(crate) async fn send(&self, frame: Frame) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }

        let (done, ack) = oneshot::channel();
        self.command_tx
            .send(Command::Send { frame, done })
            .map_err(|_| Error::ConnectionClosed)?;

        // A dropped acknowledgement means the loop tore down mid-send.
        ack.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Drops a channel from the table; called exactly once per close.
    pub(crate) fn remove_channel(&self, id: ChannelId) -> Option<Arc<ChannelEvents>> {
        self.channels.lock().remove(&id)
    }
}

// ============================================================================
// Connection
// ============================================================================

/// The multiplexing core bound to one WebSocket.
///
/// Cloning yields another handle to the same connection; all handles share
/// the channel table and event surfaces.
///
/// # Example
///
/// ```ignore
/// let conn = Connector::new("ws://127.0.0.1:9000")?.connect().await?;
/// let reply = conn.request("echo", Some(json!({"n": 1}))).await?;
/// ```
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Clone for Connection {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Connection {
    /// Creates a connection from an established WebSocket stream and
    /// spawns its delivery loop.
    pub fn new<S>(ws_stream: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            command_tx,
            channels: Mutex::new(FxHashMap::default()),
            registry: PathRegistry::new(),
            events: ConnectionEvents {
                open: EventHub::new(),
                message: EventHub::new(),
                error: EventHub::new(),
                ping: EventHub::new(),
                pong: EventHub::new(),
                close: EventHub::new(),
            },
            closed: AtomicBool::new(false),
        });

        tokio::spawn(Self::run_delivery_loop(
            ws_stream,
            command_rx,
            Arc::clone(&shared),
        ));

        Self { shared }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Returns the number of channels currently registered.
    #[inline]
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.shared.channels.lock().len()
    }

    /// Returns `true` if the channel table holds `id`.
    #[inline]
    #[must_use]
    pub fn has_channel(&self, id: ChannelId) -> bool {
        self.shared.channels.lock().contains_key(&id)
    }

    /// Returns `true` once the connection is closed or closing.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Event surfaces
    // ========================================================================

    /// Hub fired once when the delivery loop starts.
    #[must_use]
    pub fn open_events(&self) -> EventHub<()> {
        self.shared.events.open.clone()
    }

    /// Hub carrying every inbound text verbatim, before any decoding.
    #[must_use]
    pub fn message_events(&self) -> EventHub<String> {
        self.shared.events.message.clone()
    }

    /// Hub for connection-level errors (transport faults, violations).
    #[must_use]
    pub fn error_events(&self) -> EventHub<String> {
        self.shared.events.error.clone()
    }

    /// Hub for inbound ping payloads.
    #[must_use]
    pub fn ping_events(&self) -> EventHub<Vec<u8>> {
        self.shared.events.ping.clone()
    }

    /// Hub for inbound pong payloads.
    #[must_use]
    pub fn pong_events(&self) -> EventHub<Vec<u8>> {
        self.shared.events.pong.clone()
    }

    /// Hub for the connection's close event; fires exactly once, after
    /// every channel's own close event.
    #[must_use]
    pub fn close_events(&self) -> EventHub<ConnectionClose> {
        self.shared.events.close.clone()
    }

    // ========================================================================
    // Outbound API
    // ========================================================================

    /// Serializes and transmits one frame.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the connection is gone
    /// - [`Error::WebSocket`] if the transport rejects the write
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.shared.send(frame).await
    }

    /// Closes the connection with an optional reason.
    ///
    /// Idempotent: the first call sends a code-1000 close frame and tears
    /// the connection down; later calls are no-ops. Every still-open
    /// channel is force-closed before the connection's close event fires.
    pub fn close(&self, reason: Option<String>) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shared.command_tx.send(Command::Close {
            code: CLOSE_NORMAL,
            reason: reason.unwrap_or_default(),
        });
    }

    /// Opens a channel against `path` with an initial payload.
    ///
    /// The channel is registered in the table *before* the `open` frame is
    /// transmitted, so sending on it immediately is safe. Opening is
    /// fire-and-forget: the peer does not acknowledge; any reply arrives
    /// as ordinary channel traffic.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the connection is gone
    /// - [`Error::Protocol`] if identifier allocation exhausts its retries
    ///   (practically unreachable)
    pub async fn open(&self, path: &str, data: Option<Value>) -> Result<Channel> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let (id, events) = self.allocate_channel()?;
        let channel = Channel::new(id, Arc::clone(&self.shared), events);

        let frame = Frame::Open {
            id,
            path: path.to_string(),
            data,
        };
        if let Err(e) = self.shared.send(frame).await {
            self.shared.remove_channel(id);
            return Err(e);
        }

        trace!(channel = %id, path, "Channel opened");
        Ok(channel)
    }

    /// Opens a channel on `path` and awaits its terminal outcome, with the
    /// default 1000 ms deadline.
    ///
    /// See [`request_with_deadline`](Self::request_with_deadline).
    pub async fn request(&self, path: &str, data: Option<Value>) -> Result<Value> {
        self.request_with_deadline(path, data, DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    /// Opens a channel on `path` and awaits its terminal outcome.
    ///
    /// A `deadline` of [`Duration::ZERO`] waits indefinitely, bounded only
    /// by connection closure. On timeout the opened channel stays
    /// registered; the caller decides whether to close it.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if no terminal frame arrives in time
    /// - [`Error::ChannelError`] if the peer error-closes the channel
    /// - [`Error::ConnectionClosed`] if the connection goes away first
    pub async fn request_with_deadline(
        &self,
        path: &str,
        data: Option<Value>,
        deadline: Duration,
    ) -> Result<Value> {
        let channel = self.open(path, data).await?;
        channel.final_response(deadline).await
    }

    // ========================================================================
    // Path registry
    // ========================================================================

    /// Installs a handler for channels opened against `path`.
    ///
    /// A path may carry several handlers; all are invoked for every open,
    /// in registration order. A handler returning an error closes the
    /// affected channel (and only it) with the error as the reason.
    pub fn register<F, Fut>(&self, path: &str, handler: F) -> RegistrationId
    where
        F: Fn(Channel, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = Arc::new(
            move |channel: Channel, data: Option<Value>| -> BoxFuture<'static, Result<()>> {
                Box::pin(handler(channel, data))
            },
        );
        self.shared.registry.register(path, handler)
    }

    /// Removes one handler from `path`; returns `false` if absent.
    pub fn unregister(&self, path: &str, id: RegistrationId) -> bool {
        self.shared.registry.unregister(path, id)
    }

    /// Awaits the next inbound open addressed to `path`.
    ///
    /// A one-shot rendezvous: the open is consumed by this waiter instead
    /// of (or in addition to, for older opens) any persistent handlers.
    /// Races against connection closure and, if `deadline` is nonzero, a
    /// timeout; the losing branches are retracted.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the connection closes first
    /// - [`Error::Timeout`] if the deadline elapses first
    pub async fn wait_for_path(
        &self,
        path: &str,
        deadline: Duration,
    ) -> Result<(Channel, Option<Value>)> {
        let opened = self.shared.registry.wait(path);
        let closed = self.shared.events.close.watch();

        // Closure that raced our registration: the waiter queue was
        // already drained, so bail out before waiting forever.
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let (_label, outcome) = race(
            "wait for path",
            vec![
                branch("open", async move { PathOutcome::Opened(opened.wait().await) }),
                branch("connection close", async move {
                    closed.wait().await;
                    PathOutcome::Closed
                }),
            ],
            deadline,
        )
        .await?;

        match outcome {
            PathOutcome::Opened(Some(delivery)) => Ok(delivery),
            PathOutcome::Opened(None) | PathOutcome::Closed => Err(Error::ConnectionClosed),
        }
    }

    // ========================================================================
    // Channel allocation
    // ========================================================================

    /// Allocates a fresh identifier and registers its table entry.
    ///
    /// Check-and-retry against live entries, atomically under the table
    /// lock, so concurrent opens cannot collide.
    fn allocate_channel(&self) -> Result<(ChannelId, Arc<ChannelEvents>)> {
        let mut channels = self.shared.channels.lock();

        let mut id = ChannelId::generate();
        let mut attempts = 1;
        while channels.contains_key(&id) {
            if attempts >= MAX_ID_ATTEMPTS {
                return Err(Error::protocol("channel identifier space exhausted"));
            }
            id = ChannelId::generate();
            attempts += 1;
        }

        let events = Arc::new(ChannelEvents::new());
        channels.insert(id, Arc::clone(&events));
        Ok((id, events))
    }

    // ========================================================================
    // Delivery loop
    // ========================================================================

    /// Delivery loop owning the WebSocket halves.
    async fn run_delivery_loop<S>(
        ws_stream: WebSocketStream<S>,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
        shared: Arc<Shared>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_write, mut ws_read) = ws_stream.split();

        shared.events.open.publish(&());

        let close_event = loop {
            tokio::select! {
                message = ws_read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(violation) = Self::dispatch_text(text.as_str(), &shared) {
                                let reason = violation.to_string();
                                error!(%reason, "Protocol violation; closing connection");
                                shared.events.error.publish(&reason);
                                let _ = ws_write
                                    .send(close_message(CLOSE_PROTOCOL, &reason))
                                    .await;
                                break ConnectionClose {
                                    code: CLOSE_PROTOCOL,
                                    reason,
                                };
                            }
                        }

                        Some(Ok(Message::Ping(payload))) => {
                            // tungstenite queues the pong reply itself.
                            shared.events.ping.publish(&payload.to_vec());
                        }

                        Some(Ok(Message::Pong(payload))) => {
                            shared.events.pong.publish(&payload.to_vec());
                        }

                        Some(Ok(Message::Close(frame))) => {
                            debug!("WebSocket closed by remote");
                            break frame
                                .map(|f| ConnectionClose {
                                    code: u16::from(f.code),
                                    reason: f.reason.to_string(),
                                })
                                .unwrap_or(ConnectionClose {
                                    code: CLOSE_NORMAL,
                                    reason: String::new(),
                                });
                        }

                        Some(Ok(_)) => {
                            // Binary frames are not part of the protocol.
                        }

                        Some(Err(e)) => {
                            error!(error = %e, "WebSocket error");
                            shared.events.error.publish(&e.to_string());
                            break ConnectionClose {
                                code: CLOSE_ABNORMAL,
                                reason: e.to_string(),
                            };
                        }

                        None => {
                            debug!("WebSocket stream ended");
                            break ConnectionClose {
                                code: CLOSE_ABNORMAL,
                                reason: "transport stream ended".to_string(),
                            };
                        }
                    }
                }

                command = command_rx.recv() => {
                    match command {
                        Some(Command::Send { frame, done }) => {
                            Self::handle_send(frame, done, &mut ws_write).await;
                        }

                        Some(Command::Close { code, reason }) => {
                            debug!(code, reason, "Close command received");
                            let _ = ws_write.send(close_message(code, &reason)).await;
                            break ConnectionClose { code, reason };
                        }

                        None => {
                            debug!("Command channel closed");
                            break ConnectionClose {
                                code: CLOSE_NORMAL,
                                reason: String::new(),
                            };
                        }
                    }
                }
            }
        };

        // Queued sends are failed implicitly: their acknowledgement
        // senders drop with command_rx.
        Self::teardown(&shared, close_event);
    }

    /// Routes one inbound text message.
    ///
    /// Returns `Err` only for protocol violations that must close the
    /// whole connection.
    fn dispatch_text(text: &str, shared: &Arc<Shared>) -> Result<()> {
        shared.events.message.publish(&text.to_string());

        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Undecodable inbound message");
                return Ok(());
            }
        };

        trace!(kind = frame.kind(), channel = %frame.id(), "Inbound frame");
        Self::dispatch_frame(frame, shared)
    }

    /// Routes one decoded frame to the registry or the addressed channel.
    fn dispatch_frame(frame: Frame, shared: &Arc<Shared>) -> Result<()> {
        match frame {
            Frame::Open { id, path, data } => {
                let events = {
                    let mut channels = shared.channels.lock();
                    if channels.contains_key(&id) {
                        return Err(Error::protocol(format!("duplicate open for channel {id}")));
                    }
                    let events = Arc::new(ChannelEvents::new());
                    channels.insert(id, Arc::clone(&events));
                    events
                };

                let channel = Channel::new(id, Arc::clone(shared), events);
                shared.registry.dispatch(&path, channel, data);
                Ok(())
            }

            Frame::Data { id, data } => {
                let entry = shared.channels.lock().get(&id).cloned();
                match entry {
                    Some(events) => {
                        events.deliver(data.unwrap_or(Value::Null));
                        Ok(())
                    }
                    None => Err(Error::unknown_channel(id)),
                }
            }

            Frame::Close { id, data } => {
                match shared.remove_channel(id) {
                    Some(events) => events.fire_close(&CloseReason::Closed(data)),
                    // The peer closed while our own close was in flight:
                    // benign, but reported on the error hub.
                    None => Self::report_stray(shared, "close", id),
                }
                Ok(())
            }

            Frame::Error { id, reason } => {
                match shared.remove_channel(id) {
                    Some(events) => events.fire_close(&CloseReason::Error(reason)),
                    None => Self::report_stray(shared, "error", id),
                }
                Ok(())
            }
        }
    }

    /// Reports a close/error frame addressed to an identifier absent
    /// from the table. Unlike a stray data frame this does not fault the
    /// connection; both sides closing concurrently necessarily cross.
    fn report_stray(shared: &Arc<Shared>, kind: &str, id: ChannelId) {
        warn!(channel = %id, kind, "Frame for unknown channel");
        shared
            .events
            .error
            .publish(&format!("{kind} frame for unknown channel {id}"));
    }

    /// Serializes and writes one outbound frame, acknowledging the result.
    async fn handle_send<S>(
        frame: Frame,
        done: oneshot::Sender<Result<()>>,
        ws_write: &mut SplitSink<WebSocketStream<S>, Message>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                let _ = done.send(Err(Error::Json(e)));
                return;
            }
        };

        let result = ws_write
            .send(Message::Text(text.into()))
            .await
            .map_err(Error::WebSocket);
        let _ = done.send(result);
    }

    /// Final transition: force-close every channel, fail path waiters,
    /// then fire the connection close event. Runs exactly once per
    /// connection, whatever ended the loop.
    fn teardown(shared: &Arc<Shared>, close: ConnectionClose) {
        shared.closed.store(true, Ordering::SeqCst);

        let entries: Vec<_> = shared.channels.lock().drain().collect();
        let count = entries.len();
        for (_, events) in entries {
            events.fire_close(&CloseReason::Connection);
        }
        if count > 0 {
            debug!(count, "Force-closed channels at teardown");
        }

        shared.registry.fail_waiters();
        shared.events.close.publish(&close);

        debug!(code = close.code, reason = %close.reason, "Connection closed");
    }
}

/// Alternatives racing inside [`Connection::wait_for_path`].
enum PathOutcome {
    Opened(Option<(Channel, Option<Value>)>),
    Closed,
}

/// Builds an outbound WebSocket close message.
fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: code.into(),
        reason: reason.to_string().into(),
    }))
}

// ============================================================================
// Tests
// ============================================================================
