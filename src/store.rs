//! Storage backends for bucket state.
//!
//! [`BucketStore`] is a capability over a shared key-value store: register an
//! atomic read-modify-write procedure once, then execute it against a single
//! key per admission check. The store guarantees that executions targeting
//! the same key never interleave — that guarantee is the *only* thing
//! serializing concurrent checks, no application-side locking exists.
//!
//! Adapters hold no business logic and never interpret results; the
//! orchestrator validates the raw value tree and fails closed on anything
//! unexpected.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::InMemoryBucketStore;

use crate::error::RateLimitError;
use async_trait::async_trait;

/// Opaque handle to a registered procedure (the script SHA for Redis).
///
/// Cached by the limiter and reused across checks; a store may evict the
/// procedure behind it, which surfaces as
/// [`Execution`](RateLimitError::Execution) and triggers one re-registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureHandle(String);

impl ProcedureHandle {
    /// Wrap a store-assigned identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The store-assigned identifier.
    pub fn id(&self) -> &str {
        &self.0
    }
}

/// A loosely typed value returned by procedure execution.
///
/// Deliberately wider than the expected reply so a protocol mismatch reaches
/// the orchestrator's shape validation instead of being silently coerced.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    /// Absent value.
    Nil,
    /// Integer.
    Int(i64),
    /// Floating-point number.
    Float(f64),
    /// String payload (bulk or simple strings on the Redis side).
    Text(String),
    /// Ordered collection of values.
    Array(Vec<RawValue>),
}

impl RawValue {
    /// Coerce a scalar to `f64` if it is numeric.
    ///
    /// Numeric text counts: it is how fractional values survive stores that
    /// only speak integers on the wire.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RawValue::Int(i) => Some(*i as f64),
            RawValue::Float(f) => Some(*f),
            RawValue::Text(s) => s.trim().parse().ok(),
            RawValue::Nil | RawValue::Array(_) => None,
        }
    }
}

/// Capability over a shared, TTL-capable key-value store.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Register `source` as the atomic admission procedure and return a
    /// handle for [`execute`](BucketStore::execute). Idempotent: registering
    /// the same source twice is harmless.
    ///
    /// # Errors
    /// [`Registration`](RateLimitError::Registration) if the store is
    /// unreachable or rejects the procedure body.
    async fn register(&self, source: &str) -> Result<ProcedureHandle, RateLimitError>;

    /// Execute the registered procedure atomically against `key`.
    ///
    /// The procedure sees a consistent snapshot-and-write of that single key
    /// with no interleaving from any other execution on the same key,
    /// regardless of how many processes share the store.
    ///
    /// # Errors
    /// [`StoreUnavailable`](RateLimitError::StoreUnavailable) on connectivity
    /// loss; [`Execution`](RateLimitError::Execution) if the store no longer
    /// recognizes `handle` — the caller should re-register and retry once.
    async fn execute(
        &self,
        handle: &ProcedureHandle,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        now_ms: u64,
    ) -> Result<RawValue, RateLimitError>;
}
