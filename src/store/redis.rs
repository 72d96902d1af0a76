//! Redis-backed bucket store.
//!
//! The admission procedure ships to Redis once as a Lua script
//! (`SCRIPT LOAD` → SHA handle) and every check is a single `EVALSHA`
//! round-trip. Redis executes scripts without interleaving, which is what
//! makes the per-key read-modify-write atomic across the whole fleet.

use crate::error::RateLimitError;
use crate::store::{BucketStore, ProcedureHandle, RawValue};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{ErrorKind, RedisError, Value};
use std::fmt;
use tracing::debug;

/// [`BucketStore`] over a shared Redis instance.
///
/// [`ConnectionManager`] multiplexes requests and reconnects internally, so
/// this type is cheap to clone and share across tasks.
#[derive(Clone)]
pub struct RedisBucketStore {
    conn: ConnectionManager,
}

impl RedisBucketStore {
    /// Wrap an existing connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, RateLimitError> {
        let client = redis::Client::open(url)
            .map_err(|e| RateLimitError::StoreUnavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| RateLimitError::StoreUnavailable(e.to_string()))?;
        Ok(Self { conn })
    }
}

impl fmt::Debug for RedisBucketStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBucketStore").finish_non_exhaustive()
    }
}

/// Map a Redis failure onto the crate's error taxonomy. `NOSCRIPT` means the
/// script cache no longer holds our SHA (e.g., after `SCRIPT FLUSH` or a
/// restart), which the limiter recovers from by re-registering.
fn classify(err: &RedisError) -> RateLimitError {
    if err.kind() == ErrorKind::NoScriptError {
        RateLimitError::Execution(err.to_string())
    } else if err.is_io_error()
        || err.is_timeout()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
    {
        RateLimitError::StoreUnavailable(err.to_string())
    } else {
        RateLimitError::Execution(err.to_string())
    }
}

fn convert(value: Value) -> RawValue {
    match value {
        Value::Nil => RawValue::Nil,
        Value::Int(i) => RawValue::Int(i),
        Value::Double(d) => RawValue::Float(d),
        Value::BulkString(bytes) => RawValue::Text(String::from_utf8_lossy(&bytes).into_owned()),
        Value::SimpleString(s) => RawValue::Text(s),
        Value::Array(items) => RawValue::Array(items.into_iter().map(convert).collect()),
        // Anything else (maps, sets, pushes...) is not part of the wire
        // contract; pass it through as text so shape validation rejects it
        // with a useful message instead of this adapter guessing.
        other => RawValue::Text(format!("{:?}", other)),
    }
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn register(&self, source: &str) -> Result<ProcedureHandle, RateLimitError> {
        let mut conn = self.conn.clone();
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(source)
            .query_async(&mut conn)
            .await
            .map_err(|e| RateLimitError::Registration(e.to_string()))?;
        debug!(%sha, "admission script loaded");
        Ok(ProcedureHandle::new(sha))
    }

    async fn execute(
        &self,
        handle: &ProcedureHandle,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        now_ms: u64,
    ) -> Result<RawValue, RateLimitError> {
        let mut conn = self.conn.clone();
        let value: Value = redis::cmd("EVALSHA")
            .arg(handle.id())
            .arg(1)
            .arg(key)
            .arg(capacity)
            .arg(refill_rate)
            .arg(now_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(&e))?;
        Ok(convert(value))
    }
}
