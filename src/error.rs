//! Error types for the multiplexer.
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use wsmux::{Connector, Result};
//!
//! async fn example() -> Result<()> {
//!     let conn = Connector::new("ws://127.0.0.1:9000")?.connect().await?;
//!     let reply = conn.request("echo", None).await?;
//!     println!("{reply}");
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Connection | [`Error::Connection`], [`Error::ConnectionClosed`] |
//! | Channel | [`Error::ChannelClosed`], [`Error::ChannelError`] |
//! | Protocol | [`Error::Protocol`], [`Error::UnknownChannel`] |
//! | Execution | [`Error::Timeout`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::Tls`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::ChannelId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging. The channel
/// termination taxonomy distinguishes connection-level closure, graceful
/// channel closure and abnormal channel closure so callers can tell
/// "timed out, channel may still be open" apart from "closed, channel is
/// gone".
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Transport-level connection failure.
    ///
    /// Returned when the WebSocket cannot be established or a frame cannot
    /// be written.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Connection closed.
    ///
    /// Returned when an operation is attempted on, or interrupted by, a
    /// closed connection. Every channel of that connection is gone too.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Channel Errors
    // ========================================================================
    /// Channel already closed.
    ///
    /// Returned when sending on a channel that has reached its terminal
    /// state.
    #[error("Channel closed: {id}")]
    ChannelClosed {
        /// The closed channel's identifier.
        id: ChannelId,
    },

    /// Channel terminated abnormally.
    ///
    /// Carries the reason supplied by the remote peer's `error` frame, or
    /// the description of a local handler failure.
    #[error("Channel error: {reason}")]
    ChannelError {
        /// Reason reported for the abnormal termination.
        reason: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Protocol violation or invalid frame.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// Frame referenced a channel identifier absent from the table.
    ///
    /// Raised for data frames only; close/error frames for unknown
    /// identifiers are tolerated as benign close races.
    #[error("Unknown channel: {id}")]
    UnknownChannel {
        /// The unrecognized channel identifier.
        id: ChannelId,
    },

    // ========================================================================
    // Execution Errors
    // ========================================================================
    /// Operation deadline elapsed before any semantic alternative resolved.
    ///
    /// Distinct from close/error outcomes: the awaited channel may still be
    /// open and registered.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a channel error with the given reason.
    #[inline]
    pub fn channel_error(reason: impl Into<String>) -> Self {
        Self::ChannelError {
            reason: reason.into(),
        }
    }

    /// Creates a closed-channel error.
    #[inline]
    pub fn channel_closed(id: ChannelId) -> Self {
        Self::ChannelClosed { id }
    }

    /// Creates an unknown-channel error.
    #[inline]
    pub fn unknown_channel(id: ChannelId) -> Self {
        Self::UnknownChannel { id }
    }

    /// Creates a timeout error.
    #[inline]
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns `true` if this is a connection-scoped error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionClosed | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this is a channel-scoped error.
    #[inline]
    #[must_use]
    pub fn is_channel_error(&self) -> bool {
        matches!(self, Self::ChannelClosed { .. } | Self::ChannelError { .. })
    }

    /// Returns `true` if this is a protocol violation.
    #[inline]
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Protocol { .. } | Self::UnknownChannel { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::connection("handshake rejected");
        assert_eq!(err.to_string(), "Connection failed: handshake rejected");
    }

    #[test]
    fn test_timeout_display() {
        let err = Error::timeout("final response", 50);
        assert_eq!(err.to_string(), "Timeout after 50ms: final response");
    }

    #[test]
    fn test_is_timeout() {
        assert!(Error::timeout("request", 1000).is_timeout());
        assert!(!Error::ConnectionClosed.is_timeout());
    }

    #[test]
    fn test_is_connection_error() {
        assert!(Error::connection("x").is_connection_error());
        assert!(Error::ConnectionClosed.is_connection_error());
        assert!(!Error::channel_error("x").is_connection_error());
    }

    #[test]
    fn test_is_channel_error() {
        let id = ChannelId::generate();
        assert!(Error::channel_closed(id).is_channel_error());
        assert!(Error::channel_error("remote fault").is_channel_error());
        assert!(!Error::protocol("x").is_channel_error());
    }

    #[test]
    fn test_is_protocol_error() {
        let id = ChannelId::generate();
        assert!(Error::protocol("bad frame").is_protocol_error());
        assert!(Error::unknown_channel(id).is_protocol_error());
        assert!(!Error::ConnectionClosed.is_protocol_error());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::AddrInUse, "address in use");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
