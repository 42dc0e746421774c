//! Transport wrappers around the multiplexing core.
//!
//! The core only needs an established WebSocket stream; this module
//! provides the two ways of producing one:
//!
//! - [`Listener`] (server role): binds an address, upgrades inbound
//!   connections, optionally behind TLS, and surfaces each as a ready
//!   [`Connection`](crate::Connection).
//! - [`Connector`] (client role): dials a `ws://` or `wss://` URL and
//!   resolves once the transport signals open, or fails on its error.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `listener` | Accepting side, retrying accept loop, optional TLS |
//! | `connector` | Dialing side |

// ============================================================================
// Submodules
// ============================================================================

/// Accepting side: retrying accept loop, optional TLS.
pub mod listener;

/// Dialing side.
pub mod connector;

// ============================================================================
// Re-exports
// ============================================================================

pub use connector::Connector;
pub use listener::{Listener, ListenerConfig};
