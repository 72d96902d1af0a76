//! Tower middleware that enforces the limit in front of any service.
//!
//! The layer does not know *how* limiting works; it extracts a
//! [`RequestKey`] from the request (identity resolution stays with the
//! embedding application), asks the [`RateLimiter`], and either forwards the
//! call or fails with a typed rejection carrying the full [`Decision`] so
//! the caller can emit `Retry-After` / `RateLimit-*` headers and a 429 body.

use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitConfig;
use crate::decision::Decision;
use crate::error::RateLimitError;
use crate::limiter::RateLimiter;
use crate::store::BucketStore;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Route and caller identity for one request, produced by the embedding
/// application's extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestKey {
    /// Route identifier (e.g., the request path).
    pub route: String,
    /// Caller identity (user id, API key, client IP...).
    pub caller: String,
}

impl RequestKey {
    /// Build a key from route and caller parts.
    pub fn new(route: impl Into<String>, caller: impl Into<String>) -> Self {
        Self { route: route.into(), caller: caller.into() }
    }
}

/// Error type produced by [`RateLimitService`].
#[derive(Debug)]
pub enum GateError<E> {
    /// Denied by the limiter. Carries the [`Decision`] so the caller can
    /// build the rejection response.
    Rejected(Decision),
    /// The admission check itself failed. For connectivity and registration
    /// failures, fail open vs. fail closed is the caller's policy; a
    /// [`MalformedResult`](RateLimitError::MalformedResult) must always be
    /// treated as a denial.
    Limiter(RateLimitError),
    /// The wrapped service failed.
    Inner(E),
}

impl<E> GateError<E> {
    /// Check if this is a rate-limit rejection.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    /// The decision behind a rejection, if any.
    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Self::Rejected(d) => Some(d),
            _ => None,
        }
    }

    /// Get the inner service error if this is an `Inner` variant.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for GateError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(d) => {
                write!(f, "rate limited (retry after {}s)", d.retry_after_secs())
            }
            Self::Limiter(e) => write!(f, "admission check failed: {}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GateError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Limiter(e) => Some(e),
            Self::Inner(e) => Some(e),
            Self::Rejected(_) => None,
        }
    }
}

/// A layer that gates requests through a shared [`RateLimiter`].
pub struct RateLimitLayer<S, F> {
    limiter: Arc<RateLimiter<S>>,
    config: RateLimitConfig,
    key_fn: Arc<F>,
    clock: Arc<dyn Clock>,
}

impl<S, F> RateLimitLayer<S, F> {
    /// Create a layer gating requests with `config`, keyed by `key_fn`.
    pub fn new(limiter: Arc<RateLimiter<S>>, config: RateLimitConfig, key_fn: F) -> Self {
        Self { limiter, config, key_fn: Arc::new(key_fn), clock: Arc::new(SystemClock) }
    }

    /// Substitute the clock (tests use [`ManualClock`](crate::ManualClock)).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl<S, F> Clone for RateLimitLayer<S, F> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            config: self.config,
            key_fn: self.key_fn.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<S, F> fmt::Debug for RateLimitLayer<S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer").field("config", &self.config).finish_non_exhaustive()
    }
}

impl<Svc, S, F> Layer<Svc> for RateLimitLayer<S, F> {
    type Service = RateLimitService<Svc, S, F>;

    fn layer(&self, service: Svc) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
            config: self.config,
            key_fn: self.key_fn.clone(),
            clock: self.clock.clone(),
        }
    }
}

/// Middleware service produced by [`RateLimitLayer`].
pub struct RateLimitService<Svc, S, F> {
    inner: Svc,
    limiter: Arc<RateLimiter<S>>,
    config: RateLimitConfig,
    key_fn: Arc<F>,
    clock: Arc<dyn Clock>,
}

impl<Svc: Clone, S, F> Clone for RateLimitService<Svc, S, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            config: self.config,
            key_fn: self.key_fn.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<Svc, S, F> fmt::Debug for RateLimitService<Svc, S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitService").field("config", &self.config).finish_non_exhaustive()
    }
}

impl<Svc, S, F, Req> Service<Req> for RateLimitService<Svc, S, F>
where
    Svc: Service<Req> + Clone + Send + 'static,
    Svc::Future: Send,
    S: BucketStore + 'static,
    F: Fn(&Req) -> RequestKey + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = Svc::Response;
    type Error = GateError<Svc::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GateError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let key = (self.key_fn)(&req);
        let limiter = self.limiter.clone();
        let config = self.config;
        let now_ms = self.clock.now_millis();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            match limiter.check(&key.route, &key.caller, &config, now_ms).await {
                Ok(decision) if decision.admitted => {
                    inner.call(req).await.map_err(GateError::Inner)
                }
                Ok(decision) => Err(GateError::Rejected(decision)),
                Err(e) => Err(GateError::Limiter(e)),
            }
        })
    }
}
