//! First-to-resolve coordination with an optional deadline.
//!
//! Every wait in the protocol is a race between a handful of semantic
//! alternatives (a response arriving, the channel closing, the connection
//! going away) and, optionally, a deadline. [`race`] is that primitive,
//! built once: it resolves to exactly one outcome and drops the losing
//! futures, so their subscriptions (see
//! [`EventWaiter`](crate::events::EventWaiter)) are retracted.

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::time::Duration;

use futures_util::future::{BoxFuture, select_all};
use tokio::time::timeout;

use crate::error::{Error, Result};

// ============================================================================
// Types
// ============================================================================

/// One labeled entrant in a [`race`].
pub type RaceBranch<'a, T> = (&'static str, BoxFuture<'a, T>);

/// Boxes a future into a labeled race branch.
#[inline]
pub fn branch<'a, T, F>(label: &'static str, future: F) -> RaceBranch<'a, T>
where
    F: Future<Output = T> + Send + 'a,
{
    (label, Box::pin(future))
}

// ============================================================================
// race
// ============================================================================

/// Awaits the first of `branches` to resolve, within `deadline`.
///
/// Returns the winning branch's label and value; every losing branch is
/// dropped. A `deadline` of [`Duration::ZERO`] means no timeout: the race
/// is decided only by the semantic alternatives themselves.
///
/// # Errors
///
/// - [`Error::Timeout`] if a nonzero `deadline` elapses first, with
///   `operation` naming the wait for diagnostics.
/// - [`Error::Protocol`] if `branches` is empty (a race with no entrants
///   can never resolve).
pub async fn race<'a, T>(
    operation: &str,
    branches: Vec<RaceBranch<'a, T>>,
    deadline: Duration,
) -> Result<(&'static str, T)> {
    if branches.is_empty() {
        return Err(Error::protocol(format!(
            "race '{operation}' has no branches"
        )));
    }

    let (labels, futures): (Vec<_>, Vec<_>) = branches.into_iter().unzip();
    let contest = select_all(futures);

    if deadline.is_zero() {
        let (value, index, _losers) = contest.await;
        Ok((labels[index], value))
    } else {
        match timeout(deadline, contest).await {
            Ok((value, index, _losers)) => Ok((labels[index], value)),
            Err(_) => Err(Error::timeout(operation, deadline.as_millis() as u64)),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
