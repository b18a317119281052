//! Per-attempt deadline.

use std::time::Duration;

use tokio::time::Instant;

/// Stand-in for an unrepresentable deadline (roughly 30 years out).
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Fixed point in time bounding every step of one negotiation attempt.
///
/// Built on the tokio clock so paused-time tests drive it deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    /// Deadline `timeout` from now
    ///
    /// Timeouts past the clock's range saturate to a far-future deadline.
    pub fn after(timeout: Duration) -> Self {
        let now = Instant::now();
        Self(
            now.checked_add(timeout)
                .unwrap_or_else(|| now + FAR_FUTURE),
        )
    }

    /// Deadline at a given instant
    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    /// Get the underlying instant
    pub fn instant(&self) -> Instant {
        self.0
    }

    /// Time left, zero once expired
    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    /// Check if the deadline has passed
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.0
    }
}
