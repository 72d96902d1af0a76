//! The token-bucket transition: the one piece of logic that must execute
//! atomically against the shared store.
//!
//! The transition exists in two forms with identical semantics:
//! - [`step`], a pure function the in-memory store runs under its lock;
//! - [`TOKEN_BUCKET_SCRIPT`], the Lua form the Redis backend registers once
//!   and executes server-side, where Redis guarantees scripts run without
//!   interleaving.
//!
//! Keep the two in sync when changing the algorithm. All time arithmetic is
//! in milliseconds except the refill rate, which is tokens per second; every
//! conversion between the two is explicit.

/// Persisted per-key bucket state.
///
/// Created lazily: an absent key means a fresh, full bucket. Mutated only
/// inside the atomic procedure and destroyed only by the store's own TTL.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Tokens currently in the bucket; `0.0 ..= capacity`.
    pub tokens: f64,
    /// Epoch milliseconds of the last update.
    pub last: u64,
}

/// One admission attempt's full outcome, including the state and TTL the
/// store must persist alongside the caller-visible fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    /// Whether one token was consumed.
    pub admitted: bool,
    /// Milliseconds until at least one token is available (0 when admitted).
    pub wait_ms: u64,
    /// Tokens left after the attempt.
    pub tokens: f64,
    /// Seconds until the bucket is back at capacity.
    pub time_to_full_secs: u64,
    /// State to persist at the key.
    pub state: BucketState,
    /// TTL to set on the key, in milliseconds.
    pub ttl_ms: u64,
}

/// Advance the bucket to `now_ms` and try to consume one token.
///
/// `state` is the last persisted state, or `None` for a key the store has
/// never seen (or has already expired) — a fresh bucket starts full.
/// A denial persists the refilled token count without consuming anything.
///
/// Callers must ensure `capacity` and `refill_rate` are positive and finite;
/// [`RateLimitConfig::validate`](crate::RateLimitConfig::validate) does this
/// before any store round-trip.
pub fn step(state: Option<BucketState>, capacity: f64, refill_rate: f64, now_ms: u64) -> Transition {
    let (tokens, last) = match state {
        Some(s) => (s.tokens, s.last),
        None => (capacity, now_ms),
    };

    // Clock skew across processes shows up as now < last; clamp to zero
    // elapsed rather than letting a negative interval drain the bucket.
    let elapsed_ms = now_ms.saturating_sub(last) as f64;
    let tokens = (tokens + elapsed_ms / 1000.0 * refill_rate).min(capacity);

    if tokens < 1.0 {
        let wait_ms = ((1.0 - tokens) * 1000.0 / refill_rate).ceil() as u64;
        let time_to_full_secs = ((capacity - tokens) / refill_rate).ceil() as u64;
        Transition {
            admitted: false,
            wait_ms,
            tokens,
            time_to_full_secs,
            state: BucketState { tokens, last: now_ms },
            ttl_ms: ttl_ms(time_to_full_secs),
        }
    } else {
        let tokens = tokens - 1.0;
        let time_to_full_secs = ((capacity - tokens) / refill_rate).ceil() as u64;
        Transition {
            admitted: true,
            wait_ms: 0,
            tokens,
            time_to_full_secs,
            state: BucketState { tokens, last: now_ms },
            ttl_ms: ttl_ms(time_to_full_secs),
        }
    }
}

/// TTL for a bucket's key: twice its own replenishment horizon, floor one
/// second. Idle buckets self-expire instead of leaking state, but never
/// before they could plausibly be read again. Saturates: a near-zero refill
/// rate makes the horizon astronomical, and a pinned-at-max TTL is the right
/// answer there, not an overflow.
fn ttl_ms(time_to_full_secs: u64) -> u64 {
    time_to_full_secs.saturating_mul(2000).max(1000)
}

/// The transition above, expressed as a Redis Lua script.
///
/// Wire contract: `KEYS[1]` = bucket key, `ARGV` = capacity, refill rate
/// (tokens/sec), now (epoch ms). Returns a 4-element array
/// `{admitted 0|1, waitMs, tokens, timeToFullSec}`. Redis truncates Lua
/// numbers to integers in replies, so `tokens` loses its fraction on the
/// wire; the persisted hash field keeps the exact value.
pub const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local nowMs = tonumber(ARGV[3])

local t = redis.call('HGET', key, 'tokens')
local l = redis.call('HGET', key, 'last')
local tokens = tonumber(t) or capacity
local last = tonumber(l) or nowMs

local elapsed = math.max(0, nowMs - last)
tokens = math.min(capacity, tokens + (elapsed/1000.0) * rate)

if tokens < 1.0 then
  local waitMs = math.ceil((1.0 - tokens) * 1000.0 / rate)
  local timeToFull = math.ceil((capacity - tokens) / rate)

  redis.call('HSET', key, 'tokens', tokens, 'last', nowMs)
  redis.call('PEXPIRE', key, math.max(1000, timeToFull * 2000))

  return {0, waitMs, tokens, timeToFull}
end

tokens = tokens - 1.0
redis.call('HSET', key, 'tokens', tokens, 'last', nowMs)

local timeToFull = math.ceil((capacity - tokens) / rate)
redis.call('PEXPIRE', key, math.max(1000, timeToFull * 2000))

return {1, 0, tokens, timeToFull}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000_000;

    #[test]
    fn fresh_bucket_starts_full_and_admits() {
        let t = step(None, 20.0, 10.0, T0);
        assert!(t.admitted);
        assert_eq!(t.wait_ms, 0);
        assert!((t.tokens - 19.0).abs() < 1e-9);
        assert_eq!(t.time_to_full_secs, 1);
        assert_eq!(t.state.last, T0);
    }

    #[test]
    fn admission_consumes_exactly_one_token() {
        let first = step(None, 20.0, 10.0, T0);
        let second = step(Some(first.state), 20.0, 10.0, T0);
        assert!(second.admitted);
        assert!((second.tokens - 18.0).abs() < 1e-9);
    }

    #[test]
    fn same_timestamp_grants_no_extra_refill() {
        // Two steps at the same `now` must behave like zero elapsed time.
        let mut state = None;
        for _ in 0..20 {
            state = Some(step(state, 20.0, 10.0, T0).state);
        }
        let t = step(state, 20.0, 10.0, T0);
        assert!(!t.admitted);
        assert!(t.tokens < 1.0);
    }

    #[test]
    fn denial_reports_wait_and_time_to_full() {
        let mut state = None;
        for _ in 0..20 {
            state = Some(step(state, 20.0, 10.0, T0).state);
        }
        let t = step(state, 20.0, 10.0, T0);
        assert!(!t.admitted);
        assert_eq!(t.wait_ms, 100);
        assert!(t.tokens.abs() < 1e-9);
        assert_eq!(t.time_to_full_secs, 2);
    }

    #[test]
    fn denial_does_not_consume_tokens() {
        let drained = step(Some(BucketState { tokens: 0.4, last: T0 }), 5.0, 1.0, T0);
        assert!(!drained.admitted);
        assert!((drained.state.tokens - 0.4).abs() < 1e-9);

        // A second denial at the same instant sees the same balance.
        let again = step(Some(drained.state), 5.0, 1.0, T0);
        assert!(!again.admitted);
        assert!((again.state.tokens - 0.4).abs() < 1e-9);
    }

    #[test]
    fn refill_is_linear_and_capped_at_capacity() {
        let state = BucketState { tokens: 0.0, last: T0 };
        // 500ms at 10 tokens/sec -> 5 tokens.
        let t = step(Some(state), 20.0, 10.0, T0 + 500);
        assert!(t.admitted);
        assert!((t.tokens - 4.0).abs() < 1e-9);

        // A long idle period refills to capacity, not beyond.
        let t = step(Some(state), 20.0, 10.0, T0 + 3_600_000);
        assert!((t.tokens - 19.0).abs() < 1e-9);
    }

    #[test]
    fn clock_skew_clamps_to_zero_elapsed() {
        let state = BucketState { tokens: 3.0, last: T0 };
        // An out-of-order timestamp must not replenish (or drain) anything.
        let t = step(Some(state), 20.0, 10.0, T0 - 5_000);
        assert!(t.admitted);
        assert!((t.tokens - 2.0).abs() < 1e-9);
    }

    #[test]
    fn ttl_outlives_replenishment_horizon() {
        let mut state = None;
        for _ in 0..20 {
            state = Some(step(state, 20.0, 10.0, T0).state);
        }
        let t = step(state, 20.0, 10.0, T0);
        assert_eq!(t.time_to_full_secs, 2);
        assert_eq!(t.ttl_ms, 4000);
        assert!(t.ttl_ms >= 1000);
        assert!(t.ttl_ms >= t.time_to_full_secs * 2000);
    }

    #[test]
    fn ttl_saturates_for_astronomical_replenishment_horizons() {
        // A near-zero refill rate puts time-to-full near u64::MAX seconds;
        // the TTL pins at max instead of overflowing the ×2000.
        let t = step(None, 2.0, 1e-18, T0);
        assert!(t.admitted);
        assert!(t.time_to_full_secs > u64::MAX / 2000);
        assert_eq!(t.ttl_ms, u64::MAX);
    }

    #[test]
    fn ttl_has_one_second_floor() {
        // A full bucket has nothing to replenish; TTL still floors at 1s.
        let t = step(None, 1.5, 100.0, T0);
        assert_eq!(t.time_to_full_secs, 1);
        assert_eq!(t.ttl_ms, 2000);
        let full = step(Some(BucketState { tokens: 100.0, last: T0 }), 100.0, 1000.0, T0);
        assert_eq!(full.time_to_full_secs, 1);
        assert!(full.ttl_ms >= 1000);
    }

    #[test]
    fn admitted_count_respects_bucket_bound() {
        // floor(C + R*W) bound: C=5, R=2/sec over a 3s window -> at most 11.
        let mut state = None;
        let mut admitted = 0;
        for i in 0..60 {
            let now = T0 + i * 50; // every 50ms for 3s
            let t = step(state, 5.0, 2.0, now);
            state = Some(t.state);
            if t.admitted {
                admitted += 1;
            }
        }
        assert!(admitted <= 11, "admitted {} > bound 11", admitted);
    }
}
