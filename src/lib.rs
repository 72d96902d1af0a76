#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Floodgate
//!
//! Distributed token-bucket rate limiting for fleets of stateless processes.
//!
//! Every process points at the same TTL-capable key-value store; the bucket
//! math runs *inside* the store as a single atomic procedure, so N processes
//! enforce one consistent limit per (route, caller) pair without coordinating
//! with each other.
//!
//! ## Architecture
//!
//! - [`BucketStore`]: capability over the shared store — register an atomic
//!   read-modify-write procedure, execute it against one key. The Redis
//!   backend ships the procedure as a Lua script; the in-memory backend runs
//!   the same transition under a lock.
//! - [`RateLimiter`]: derives the bucket key, caches the registered procedure
//!   handle, interprets the raw result, and emits a [`Decision`].
//! - [`RateLimitLayer`]: tower middleware that turns a denial into a typed
//!   rejection carrying everything a 429 response needs.
//!
//! ## Quick start
//!
//! ```rust
//! use floodgate::{InMemoryBucketStore, RateLimitConfig, RateLimiter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), floodgate::RateLimitError> {
//!     let limiter = RateLimiter::new(InMemoryBucketStore::new());
//!     let config = RateLimitConfig::new(20.0, 10.0);
//!
//!     let decision = limiter.check("/search", "user-42", &config, 1_700_000_000_000).await?;
//!     assert!(decision.admitted);
//!     assert_eq!(decision.remaining(), 19);
//!     Ok(())
//! }
//! ```

pub mod bucket;
pub mod clock;
pub mod config;
pub mod decision;
pub mod error;
pub mod limiter;
pub mod middleware;
pub mod store;

// Re-exports
pub use bucket::{BucketState, Transition};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RateLimitConfig;
pub use decision::Decision;
pub use error::RateLimitError;
pub use limiter::{RateLimiter, RateLimiterBuilder};
pub use middleware::{GateError, RateLimitLayer, RateLimitService, RequestKey};
#[cfg(feature = "redis")]
pub use store::redis::RedisBucketStore;
pub use store::{BucketStore, InMemoryBucketStore, ProcedureHandle, RawValue};
