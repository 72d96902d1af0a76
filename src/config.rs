//! Per-check rate limit configuration.

use crate::error::RateLimitError;

/// Token-bucket parameters for one admission check.
///
/// Not persisted anywhere; every call to [`check`](crate::RateLimiter::check)
/// supplies its own config, so different routes can carry different limits
/// through the same limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RateLimitConfig {
    /// Maximum tokens the bucket can hold (burst size).
    pub capacity: f64,
    /// Tokens replenished per second.
    pub refill_rate: f64,
}

impl RateLimitConfig {
    /// Create a config with the given capacity and refill rate (tokens/sec).
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self { capacity, refill_rate }
    }

    /// Reject non-positive or non-finite parameters.
    ///
    /// A zero refill rate would divide by zero computing wait times inside
    /// the admission procedure, so the limiter validates before every store
    /// round-trip rather than letting the procedure fail.
    pub fn validate(&self) -> Result<(), RateLimitError> {
        if !self.capacity.is_finite() || self.capacity <= 0.0 {
            return Err(RateLimitError::InvalidConfig(format!(
                "capacity must be a positive finite number, got {}",
                self.capacity
            )));
        }
        if !self.refill_rate.is_finite() || self.refill_rate <= 0.0 {
            return Err(RateLimitError::InvalidConfig(format!(
                "refill_rate must be a positive finite number, got {}",
                self.refill_rate
            )));
        }
        Ok(())
    }
}
