//! The outcome of one admission check.

use std::time::Duration;

/// The decision returned by [`check`](crate::RateLimiter::check).
///
/// Ephemeral: describes exactly one admission check and is never persisted.
/// The helpers map onto the conventional rate-limit response headers
/// (`RateLimit-Limit` is the caller's own capacity value,
/// [`remaining`](Decision::remaining) → `RateLimit-Remaining`,
/// [`time_to_full_secs`](Decision::time_to_full_secs) → `RateLimit-Reset`,
/// [`retry_after_secs`](Decision::retry_after_secs) → `Retry-After`).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Decision {
    /// Whether the request may proceed (exactly one token was consumed).
    pub admitted: bool,
    /// Milliseconds until at least one token is available. Zero when
    /// admitted.
    pub wait_ms: u64,
    /// Tokens left in the bucket after this check. Fractional; the Redis
    /// backend truncates to whole tokens on the wire, the in-memory backend
    /// reports the exact value.
    pub tokens_remaining: f64,
    /// Seconds until the bucket is back at full capacity.
    pub time_to_full_secs: u64,
}

impl Decision {
    /// Check if the request was admitted.
    pub fn is_admitted(&self) -> bool {
        self.admitted
    }

    /// Remaining tokens as surfaced to clients: floored and clamped at zero.
    pub fn remaining(&self) -> u64 {
        if self.tokens_remaining <= 0.0 {
            0
        } else {
            self.tokens_remaining.floor() as u64
        }
    }

    /// Seconds a denied caller should wait before retrying. At least 1 even
    /// for sub-second waits, so a literal `Retry-After` header never says
    /// "now". Zero only for admitted requests.
    pub fn retry_after_secs(&self) -> u64 {
        if self.admitted {
            0
        } else {
            self.wait_ms.div_ceil(1000).max(1)
        }
    }

    /// Wait time as a [`Duration`].
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    /// Time until full capacity as a [`Duration`].
    pub fn time_to_full(&self) -> Duration {
        Duration::from_secs(self.time_to_full_secs)
    }
}
