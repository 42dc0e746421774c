//! Multiplexing core: connection, channels, path registry.
//!
//! One [`Connection`] per physical WebSocket; many [`Channel`]s per
//! connection, each addressed by a [`ChannelId`](crate::identifiers::ChannelId)
//! unique within the connection's lifetime.
//!
//! # Data flow
//!
//! ```text
//! inbound frame -> delivery loop -> decode -> open:             path registry -> new Channel
//!                                             data/close/error: channel table lookup
//! outbound: Channel::send / Connection::open -> delivery loop -> WebSocket
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | Connection, channel table, delivery loop |
//! | `channel` | Channel lifecycle and terminal-outcome waits |
//! | `registry` | Path name → handler dispatch |

// ============================================================================
// Submodules
// ============================================================================

/// Channel lifecycle and terminal-outcome waits.
pub mod channel;

/// Connection, channel table, delivery loop.
pub mod connection;

/// Path name → handler dispatch.
pub mod registry;

// ============================================================================
// Re-exports
// ============================================================================

pub use channel::{Channel, CloseReason};
pub use connection::{Connection, ConnectionClose, DEFAULT_REQUEST_TIMEOUT};
pub use registry::PathHandler;
