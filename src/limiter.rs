//! The admission orchestrator.
//!
//! [`RateLimiter`] owns the procedure definition, derives the per-request
//! bucket key, keeps the one cached procedure handle, and turns the store's
//! raw reply into a [`Decision`]. It performs no internal threading and no
//! background work; the only thing that suspends is the store round-trip.

use crate::bucket::TOKEN_BUCKET_SCRIPT;
use crate::config::RateLimitConfig;
use crate::decision::Decision;
use crate::error::RateLimitError;
use crate::store::{BucketStore, ProcedureHandle, RawValue};
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const DEFAULT_KEY_PREFIX: &str = "rl";

/// Per-(route, caller) admission checks against a shared [`BucketStore`].
///
/// One limiter instance serves any number of routes and callers; state lives
/// entirely in the store, keyed by `"{prefix}:{route}:{caller}"`. The only
/// thing held here is the cached procedure handle: populated on first use,
/// invalidated by [`request_reload`](RateLimiter::request_reload) or by a
/// stale-handle recovery, never refreshed implicitly per call.
#[derive(Debug)]
pub struct RateLimiter<S> {
    store: S,
    key_prefix: String,
    handle: ArcSwapOption<ProcedureHandle>,
    reload: AtomicBool,
}

impl<S: BucketStore> RateLimiter<S> {
    /// Create a limiter with the default `rl` key prefix.
    pub fn new(store: S) -> Self {
        Self::builder(store).build()
    }

    /// Start building a limiter.
    pub fn builder(store: S) -> RateLimiterBuilder<S> {
        RateLimiterBuilder { store, key_prefix: DEFAULT_KEY_PREFIX.to_string() }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Key under which (route, caller) bucket state lives in the store.
    /// Every process sharing the store derives the same key for the same
    /// pair, which is what makes the limit fleet-wide.
    pub fn bucket_key(&self, route: &str, caller: &str) -> String {
        format!("{}:{}:{}", self.key_prefix, route, caller)
    }

    /// Raise the reload signal: the next check re-registers the admission
    /// procedure before executing, picking up a live procedure update
    /// without a process restart. One-shot; subsequent checks go back to the
    /// cached handle.
    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::Release);
    }

    async fn ensure_registered(&self, force: bool) -> Result<Arc<ProcedureHandle>, RateLimitError> {
        if !force {
            if let Some(handle) = self.handle.load_full() {
                return Ok(handle);
            }
        }
        // Concurrent first checks may both register; the registration is
        // idempotent so last-write-wins on the cache is harmless.
        let handle = Arc::new(self.store.register(TOKEN_BUCKET_SCRIPT).await?);
        debug!(handle = handle.id(), "admission procedure registered");
        self.handle.store(Some(handle.clone()));
        Ok(handle)
    }

    /// Run one admission check for (route, caller) at `now_ms` (epoch
    /// milliseconds).
    ///
    /// Admission consumes exactly one token; a denial consumes nothing and
    /// reports how long until a token is available. All checks against the
    /// same key are serialized by the store's atomic execution, no matter how
    /// many processes call in concurrently.
    ///
    /// # Cancellation
    ///
    /// Dropping the returned future abandons the in-flight store call but
    /// does not roll it back: a cancelled check may still have consumed a
    /// token.
    ///
    /// # Errors
    ///
    /// [`InvalidConfig`](RateLimitError::InvalidConfig) before any store
    /// round-trip; [`StoreUnavailable`](RateLimitError::StoreUnavailable) and
    /// [`Registration`](RateLimitError::Registration) propagate for the
    /// caller's fail-open/fail-closed policy;
    /// [`MalformedResult`](RateLimitError::MalformedResult) means the store
    /// reply did not match the wire contract and the request must be denied.
    /// A stale handle ([`Execution`](RateLimitError::Execution)) is recovered
    /// by re-registering and retrying exactly once before propagating.
    pub async fn check(
        &self,
        route: &str,
        caller: &str,
        config: &RateLimitConfig,
        now_ms: u64,
    ) -> Result<Decision, RateLimitError> {
        config.validate()?;
        let key = self.bucket_key(route, caller);

        let force = self.reload.swap(false, Ordering::AcqRel);
        if force {
            warn!("reload requested; re-registering admission procedure");
        }
        let handle = self.ensure_registered(force).await?;

        let raw = match self
            .store
            .execute(&handle, &key, config.capacity, config.refill_rate, now_ms)
            .await
        {
            Ok(raw) => raw,
            Err(RateLimitError::Execution(reason)) => {
                // The store evicted our procedure (e.g. script cache flush).
                // Re-register and retry once; a second failure propagates.
                warn!(%reason, "procedure handle rejected; re-registering");
                let handle = self.ensure_registered(true).await?;
                self.store
                    .execute(&handle, &key, config.capacity, config.refill_rate, now_ms)
                    .await?
            }
            Err(e) => return Err(e),
        };

        parse_decision(&raw)
    }
}

/// Builder for [`RateLimiter`].
#[derive(Debug)]
pub struct RateLimiterBuilder<S> {
    store: S,
    key_prefix: String,
}

impl<S: BucketStore> RateLimiterBuilder<S> {
    /// Override the bucket key prefix (default `rl`). Processes must agree
    /// on the prefix to share limits.
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Finish building.
    pub fn build(self) -> RateLimiter<S> {
        RateLimiter {
            store: self.store,
            key_prefix: self.key_prefix,
            handle: ArcSwapOption::const_empty(),
            reload: AtomicBool::new(false),
        }
    }
}

/// Validate the four-field wire shape and map it onto a [`Decision`].
/// Anything unexpected is a protocol mismatch and must fail closed.
fn parse_decision(raw: &RawValue) -> Result<Decision, RateLimitError> {
    let fields = match raw {
        RawValue::Array(items) if items.len() == 4 => items,
        RawValue::Array(items) => {
            return Err(RateLimitError::MalformedResult(format!(
                "expected 4 fields, got {}",
                items.len()
            )))
        }
        other => {
            return Err(RateLimitError::MalformedResult(format!(
                "expected an array reply, got {:?}",
                other
            )))
        }
    };

    let flag = numeric_field(fields, 0, "admitted")?;
    let wait_ms = numeric_field(fields, 1, "wait_ms")?;
    let tokens_remaining = numeric_field(fields, 2, "tokens_remaining")?;
    let time_to_full = numeric_field(fields, 3, "time_to_full_secs")?;

    let admitted = if flag == 0.0 {
        false
    } else if flag == 1.0 {
        true
    } else {
        return Err(RateLimitError::MalformedResult(format!(
            "admitted flag must be 0 or 1, got {}",
            flag
        )));
    };
    if wait_ms < 0.0 {
        return Err(RateLimitError::MalformedResult(format!("negative wait_ms: {}", wait_ms)));
    }
    if time_to_full < 0.0 {
        return Err(RateLimitError::MalformedResult(format!(
            "negative time_to_full_secs: {}",
            time_to_full
        )));
    }

    Ok(Decision {
        admitted,
        wait_ms: wait_ms as u64,
        tokens_remaining,
        time_to_full_secs: time_to_full as u64,
    })
}

fn numeric_field(fields: &[RawValue], idx: usize, name: &str) -> Result<f64, RateLimitError> {
    let value = fields[idx].as_f64().ok_or_else(|| {
        RateLimitError::MalformedResult(format!("field {} is not numeric: {:?}", name, fields[idx]))
    })?;
    if !value.is_finite() {
        return Err(RateLimitError::MalformedResult(format!("field {} is not finite", name)));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    const T0: u64 = 1_700_000_000_000;

    /// Store double that replays queued execute results and counts calls.
    #[derive(Default)]
    struct ScriptedStore {
        registrations: AtomicUsize,
        executions: AtomicUsize,
        replies: Mutex<Vec<Result<RawValue, RateLimitError>>>,
    }

    impl ScriptedStore {
        fn queue(self, reply: Result<RawValue, RateLimitError>) -> Self {
            self.replies.lock().unwrap().insert(0, reply);
            self
        }
    }

    #[async_trait]
    impl BucketStore for ScriptedStore {
        async fn register(&self, _source: &str) -> Result<ProcedureHandle, RateLimitError> {
            let n = self.registrations.fetch_add(1, Ordering::SeqCst);
            Ok(ProcedureHandle::new(format!("sha-{}", n)))
        }

        async fn execute(
            &self,
            _handle: &ProcedureHandle,
            _key: &str,
            _capacity: f64,
            _refill_rate: f64,
            _now_ms: u64,
        ) -> Result<RawValue, RateLimitError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            self.replies.lock().unwrap().pop().expect("unexpected execute call")
        }
    }

    fn admit_reply() -> RawValue {
        RawValue::Array(vec![
            RawValue::Int(1),
            RawValue::Int(0),
            RawValue::Float(19.0),
            RawValue::Int(1),
        ])
    }

    fn config() -> RateLimitConfig {
        RateLimitConfig::new(20.0, 10.0)
    }

    #[tokio::test]
    async fn registers_lazily_and_caches_the_handle() {
        let store = ScriptedStore::default().queue(Ok(admit_reply())).queue(Ok(admit_reply()));
        let limiter = RateLimiter::new(store);

        limiter.check("/a", "u1", &config(), T0).await.unwrap();
        limiter.check("/a", "u1", &config(), T0).await.unwrap();

        assert_eq!(limiter.store().registrations.load(Ordering::SeqCst), 1);
        assert_eq!(limiter.store().executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reload_signal_forces_exactly_one_reregistration() {
        let store = ScriptedStore::default()
            .queue(Ok(admit_reply()))
            .queue(Ok(admit_reply()))
            .queue(Ok(admit_reply()));
        let limiter = RateLimiter::new(store);

        limiter.check("/a", "u1", &config(), T0).await.unwrap();
        limiter.request_reload();
        limiter.check("/a", "u1", &config(), T0).await.unwrap();
        limiter.check("/a", "u1", &config(), T0).await.unwrap();

        assert_eq!(limiter.store().registrations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_handle_reregisters_and_retries_once() {
        let store = ScriptedStore::default()
            .queue(Err(RateLimitError::Execution("NOSCRIPT".into())))
            .queue(Ok(admit_reply()));
        let limiter = RateLimiter::new(store);

        let decision = limiter.check("/a", "u1", &config(), T0).await.unwrap();
        assert!(decision.admitted);
        assert_eq!(limiter.store().registrations.load(Ordering::SeqCst), 2);
        assert_eq!(limiter.store().executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_stale_handle_failure_propagates() {
        let store = ScriptedStore::default()
            .queue(Err(RateLimitError::Execution("NOSCRIPT".into())))
            .queue(Err(RateLimitError::Execution("still gone".into())));
        let limiter = RateLimiter::new(store);

        let err = limiter.check("/a", "u1", &config(), T0).await.unwrap_err();
        assert!(err.is_execution());
        assert_eq!(limiter.store().executions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn store_unavailable_propagates_without_retry() {
        let store = ScriptedStore::default()
            .queue(Err(RateLimitError::StoreUnavailable("connection reset".into())));
        let limiter = RateLimiter::new(store);

        let err = limiter.check("/a", "u1", &config(), T0).await.unwrap_err();
        assert!(err.is_store_unavailable());
        assert_eq!(limiter.store().executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_config_rejected_before_any_store_call() {
        let limiter = RateLimiter::new(ScriptedStore::default());
        let bad = RateLimitConfig::new(20.0, 0.0);

        let err = limiter.check("/a", "u1", &bad, T0).await.unwrap_err();
        assert!(err.is_invalid_config());
        assert_eq!(limiter.store().registrations.load(Ordering::SeqCst), 0);
        assert_eq!(limiter.store().executions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_replies_fail_closed() {
        let cases = vec![
            RawValue::Int(1),
            RawValue::Array(vec![RawValue::Int(1), RawValue::Int(0)]),
            RawValue::Array(vec![
                RawValue::Int(2),
                RawValue::Int(0),
                RawValue::Float(19.0),
                RawValue::Int(1),
            ]),
            RawValue::Array(vec![
                RawValue::Int(1),
                RawValue::Text("soon".into()),
                RawValue::Float(19.0),
                RawValue::Int(1),
            ]),
            RawValue::Array(vec![
                RawValue::Int(1),
                RawValue::Int(-5),
                RawValue::Float(19.0),
                RawValue::Int(1),
            ]),
            RawValue::Array(vec![
                RawValue::Int(1),
                RawValue::Int(0),
                RawValue::Float(f64::NAN),
                RawValue::Int(1),
            ]),
        ];
        for raw in cases {
            let store = ScriptedStore::default().queue(Ok(raw.clone()));
            let limiter = RateLimiter::new(store);
            let err = limiter.check("/a", "u1", &config(), T0).await.unwrap_err();
            assert!(err.is_malformed_result(), "{:?} should be malformed", raw);
        }
    }

    #[tokio::test]
    async fn numeric_text_fields_parse() {
        // Stores that only speak strings on the wire still satisfy the
        // contract as long as the text is numeric.
        let raw = RawValue::Array(vec![
            RawValue::Int(0),
            RawValue::Text("100".into()),
            RawValue::Text("0.5".into()),
            RawValue::Int(2),
        ]);
        let store = ScriptedStore::default().queue(Ok(raw));
        let limiter = RateLimiter::new(store);
        let decision = limiter.check("/a", "u1", &config(), T0).await.unwrap();
        assert!(!decision.admitted);
        assert_eq!(decision.wait_ms, 100);
        assert!((decision.tokens_remaining - 0.5).abs() < 1e-9);
    }

    #[test]
    fn bucket_keys_scope_route_and_caller_under_prefix() {
        let limiter = RateLimiter::builder(ScriptedStore::default()).key_prefix("gate").build();
        assert_eq!(limiter.bucket_key("/search", "user-42"), "gate:/search:user-42");

        let default = RateLimiter::new(ScriptedStore::default());
        assert_eq!(default.bucket_key("/search", "anonymous"), "rl:/search:anonymous");
    }
}
