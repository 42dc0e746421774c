//! Type-safe identifiers.
//!
//! Newtype wrappers prevent mixing incompatible identifier kinds at
//! compile time:
//!
//! - [`ChannelId`] - wire-visible channel identifier (v4 UUID)
//! - [`SubscriptionId`] - event hub subscription token
//! - [`RegistrationId`] - path handler registration token

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// ChannelId
// ============================================================================

/// Unique identifier of one multiplexed channel.
///
/// Valid only within the lifetime of the connection that allocated or
/// received it. Serialized as a UUID string in the wire frame's `uuid`
/// field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(Uuid);

impl ChannelId {
    /// Generates a new random identifier.
    ///
    /// Collision probability is negligible, but callers allocating into a
    /// channel table must still check-and-retry against live entries.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// SubscriptionId
// ============================================================================

/// Token returned by [`EventHub::subscribe`](crate::events::EventHub::subscribe).
///
/// Process-unique; used to retract a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Returns the next process-unique subscription token.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

// ============================================================================
// RegistrationId
// ============================================================================

/// Token returned by path handler registration.
///
/// Used to remove one handler from a path without disturbing the others
/// registered on the same path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

impl RegistrationId {
    /// Returns the next process-unique registration token.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg-{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================
