//! Protocol frame types and wire encoding.
//!
//! Frames travel as JSON text over the WebSocket. The discriminator is the
//! optional `type` field; a frame without one is an ordinary data frame.
//!
//! # Format
//!
//! ```json
//! {"uuid": "…", "type": "open", "path": "echo", "data": {"n": 1}}
//! {"uuid": "…", "data": {"n": 2}}
//! {"uuid": "…", "type": "close", "data": {"n": 3}}
//! {"uuid": "…", "type": "error", "reason": "handler failed"}
//! ```

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::identifiers::ChannelId;

// ============================================================================
// Frame
// ============================================================================

/// One protocol frame.
///
/// Every frame carries the identifier of the channel it is scoped to.
/// Non-`Open` frames must reference an identifier already present in the
/// receiver's channel table; the dispatcher decides how violations are
/// handled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireFrame", into = "WireFrame")]
pub enum Frame {
    /// Request to create a channel bound to `path`, with initial payload.
    Open {
        /// Identifier the new channel will live under.
        id: ChannelId,
        /// Named endpoint the channel targets.
        path: String,
        /// Initial payload delivered to the path handler.
        data: Option<Value>,
    },

    /// Payload delivered to an existing channel.
    Data {
        /// Target channel.
        id: ChannelId,
        /// Carried payload.
        data: Option<Value>,
    },

    /// Graceful channel termination, optionally carrying a final payload.
    Close {
        /// Target channel.
        id: ChannelId,
        /// Final payload, if any.
        data: Option<Value>,
    },

    /// Abnormal channel termination with a reason string.
    Error {
        /// Target channel.
        id: ChannelId,
        /// Reason supplied by the terminating side.
        reason: String,
    },
}

impl Frame {
    /// Returns the channel identifier this frame is scoped to.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ChannelId {
        match self {
            Self::Open { id, .. }
            | Self::Data { id, .. }
            | Self::Close { id, .. }
            | Self::Error { id, .. } => *id,
        }
    }

    /// Returns a short name for the frame kind, for logging.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Data { .. } => "data",
            Self::Close { .. } => "close",
            Self::Error { .. } => "error",
        }
    }
}

// ============================================================================
// WireFrame
// ============================================================================

/// Flat wire representation bridging serde and [`Frame`].
///
/// Decoding is fallible: the `type` field dictates which other fields must
/// be present, which serde's derive cannot express directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFrame {
    uuid: ChannelId,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<WireKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

/// Value of the wire `type` discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum WireKind {
    Open,
    Close,
    Error,
}

impl TryFrom<WireFrame> for Frame {
    type Error = Error;

    fn try_from(wire: WireFrame) -> Result<Self, Error> {
        let id = wire.uuid;
        match wire.kind {
            Some(WireKind::Open) => {
                let path = wire
                    .path
                    .ok_or_else(|| Error::protocol("open frame missing path"))?;
                Ok(Self::Open {
                    id,
                    path,
                    data: wire.data,
                })
            }
            Some(WireKind::Close) => Ok(Self::Close {
                id,
                data: wire.data,
            }),
            Some(WireKind::Error) => {
                let reason = wire
                    .reason
                    .ok_or_else(|| Error::protocol("error frame missing reason"))?;
                Ok(Self::Error { id, reason })
            }
            None => Ok(Self::Data {
                id,
                data: wire.data,
            }),
        }
    }
}

impl From<Frame> for WireFrame {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Open { id, path, data } => Self {
                uuid: id,
                kind: Some(WireKind::Open),
                path: Some(path),
                data,
                reason: None,
            },
            Frame::Data { id, data } => Self {
                uuid: id,
                kind: None,
                path: None,
                data,
                reason: None,
            },
            Frame::Close { id, data } => Self {
                uuid: id,
                kind: Some(WireKind::Close),
                path: None,
                data,
                reason: None,
            },
            Frame::Error { id, reason } => Self {
                uuid: id,
                kind: Some(WireKind::Error),
                path: None,
                data: None,
                reason: Some(reason),
            },
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
