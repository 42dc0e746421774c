//! Wire protocol message types.
//!
//! One multiplexed connection carries a stream of JSON text frames, each
//! tagged with the channel identifier it belongs to:
//!
//! | `type` | Direction | Purpose |
//! |--------|-----------|---------|
//! | `open` | either | create a channel bound to a path |
//! | *(omitted)* | either | payload for an existing channel |
//! | `close` | either | graceful channel termination |
//! | `error` | either | abnormal channel termination |
//!
//! See [`frame::Frame`] for the exact field layout.

// ============================================================================
// Submodules
// ============================================================================

/// Frame definitions and wire encoding.
pub mod frame;

// ============================================================================
// Re-exports
// ============================================================================

pub use frame::Frame;
