//! wsmux - Logical-channel multiplexing over one WebSocket connection.
//!
//! Many independent, uniquely-identified channels share a single
//! full-duplex transport. Each channel behaves like a small bidirectional
//! stream; a structured framing protocol (open / data / close / error)
//! plus path-based dispatch lets a peer open a channel against a named
//! endpoint, analogous to a lightweight RPC call.
//!
//! # Architecture
//!
//! - One [`Connection`] per WebSocket; it owns the channel table, decodes
//!   inbound frames and routes them by channel identifier.
//! - An `open` frame targets a path; registered handlers (or a one-shot
//!   [`Connection::wait_for_path`]) receive the new [`Channel`].
//! - Frames for one channel arrive in transport order; channels are
//!   independent consumers and never block each other.
//! - Closure is always scoped: a `close`/`error` frame ends exactly one
//!   channel, while connection teardown force-closes every channel before
//!   the connection's own close event fires.
//!
//! # Quick Start
//!
//! ```no_run
//! use serde_json::json;
//! use wsmux::{Connector, Listener, ListenerConfig, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Server: echo back the open payload as the final response.
//!     let mut listener = Listener::bind(ListenerConfig::localhost()).await?;
//!     let url = listener.ws_url();
//!     tokio::spawn(async move {
//!         while let Some(conn) = listener.accept().await {
//!             conn.register("echo", |channel, data| async move {
//!                 channel.close(data).await;
//!                 Ok(())
//!             });
//!         }
//!     });
//!
//!     // Client: request/response over a fresh channel.
//!     let conn = Connector::new(&url)?.connect().await?;
//!     let reply = conn.request("echo", Some(json!({"n": 1}))).await?;
//!     assert_eq!(reply, json!({"n": 1}));
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`mux`] | Multiplexing core: [`Connection`], [`Channel`], path registry |
//! | [`transport`] | [`Listener`] (server role) and [`Connector`] (client role) |
//! | [`protocol`] | Wire frame types |
//! | [`events`] | Multi-listener event hub and one-shot waiters |
//! | [`race`] | First-to-resolve coordination with optional deadline |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe identifier wrappers |

// ============================================================================
// Modules
// ============================================================================

/// Error types and result aliases.
pub mod error;

/// Event fan-out primitive.
pub mod events;

/// Type-safe identifiers.
pub mod identifiers;

/// Multiplexing core: connection, channels, path registry.
pub mod mux;

/// Wire protocol message types.
pub mod protocol;

/// First-to-resolve coordination with an optional deadline.
pub mod race;

/// Transport wrappers: listener and connector.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Core types
pub use mux::{Channel, CloseReason, Connection, ConnectionClose, DEFAULT_REQUEST_TIMEOUT};

// Transport types
pub use transport::{Connector, Listener, ListenerConfig};

// Protocol types
pub use protocol::Frame;

// Event types
pub use events::{EventHub, EventWaiter};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ChannelId, RegistrationId, SubscriptionId};
