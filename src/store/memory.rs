//! Mutex-serialized in-process bucket store.
//!
//! Implements the same contract as the Redis backend by running the pure
//! transition from [`crate::bucket`] under a store-wide lock — the
//! "read-modify-write with no interleaving" requirement met with a mutex
//! instead of server-side scripting. Useful as a test double and for
//! single-process deployments; it cannot coordinate buckets across
//! processes.
//!
//! TTLs are honored lazily: an expired entry is treated as absent on the
//! next access, and [`purge_expired`](InMemoryBucketStore::purge_expired)
//! drops dead entries eagerly.

use crate::bucket::{self, BucketState};
use crate::error::RateLimitError;
use crate::store::{BucketStore, ProcedureHandle, RawValue};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: BucketState,
    expires_at_ms: u64,
}

/// In-memory [`BucketStore`]. Cheap to clone; clones share the same buckets.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBucketStore {
    buckets: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InMemoryBucketStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining TTL in milliseconds for `key` as of `now_ms`, if the key is
    /// still live.
    pub fn time_to_live(&self, key: &str, now_ms: u64) -> Option<u64> {
        let buckets = self.buckets.lock().unwrap();
        buckets
            .get(key)
            .filter(|e| e.expires_at_ms > now_ms)
            .map(|e| e.expires_at_ms - now_ms)
    }

    /// Number of live buckets as of `now_ms`.
    pub fn live_buckets(&self, now_ms: u64) -> usize {
        let buckets = self.buckets.lock().unwrap();
        buckets.values().filter(|e| e.expires_at_ms > now_ms).count()
    }

    /// Drop entries whose TTL has passed.
    pub fn purge_expired(&self, now_ms: u64) {
        let mut buckets = self.buckets.lock().unwrap();
        buckets.retain(|_, e| e.expires_at_ms > now_ms);
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn register(&self, source: &str) -> Result<ProcedureHandle, RateLimitError> {
        // Nothing ships anywhere: the transition is compiled in. The handle
        // still round-trips so orchestrator caching behaves identically to
        // the distributed backend.
        let _ = source;
        Ok(ProcedureHandle::new("in-memory"))
    }

    async fn execute(
        &self,
        _handle: &ProcedureHandle,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        now_ms: u64,
    ) -> Result<RawValue, RateLimitError> {
        let mut buckets = self.buckets.lock().unwrap();
        let state = buckets.get(key).filter(|e| e.expires_at_ms > now_ms).map(|e| e.state);
        let t = bucket::step(state, capacity, refill_rate, now_ms);
        buckets.insert(
            key.to_string(),
            Entry { state: t.state, expires_at_ms: now_ms.saturating_add(t.ttl_ms) },
        );
        Ok(RawValue::Array(vec![
            RawValue::Int(i64::from(t.admitted)),
            RawValue::Int(t.wait_ms as i64),
            RawValue::Float(t.tokens),
            RawValue::Int(t.time_to_full_secs as i64),
        ]))
    }
}
