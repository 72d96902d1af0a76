//! Error types for admission checks.

/// Unified error type for admission checks against the shared store.
///
/// Nothing is swallowed inside the crate: every failure surfaces with enough
/// context for the embedding layer to choose fail-open or fail-closed
/// behavior. The only internal recovery is the single re-registration and
/// retry performed for [`Execution`](RateLimitError::Execution).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// The store rejected or could not retain the admission procedure.
    /// Transient registration failures are safe to retry.
    #[error("procedure registration failed: {0}")]
    Registration(String),
    /// Connectivity to the shared store was lost or the call timed out.
    /// Whether this admits or denies the request is the caller's policy.
    #[error("bucket store unavailable: {0}")]
    StoreUnavailable(String),
    /// The store no longer recognizes the registered procedure handle
    /// (e.g., its script cache was flushed). Recovered internally by one
    /// re-registration and one retry; surfaced only when that also fails.
    #[error("procedure execution failed: {0}")]
    Execution(String),
    /// The store returned something other than the expected four-field
    /// result. Indicates a protocol mismatch or a procedure bug; always
    /// fatal for the request and never retried. Callers must deny.
    #[error("malformed result from bucket store: {0}")]
    MalformedResult(String),
    /// Capacity or refill rate was non-positive or non-finite; rejected
    /// before any store round-trip.
    #[error("invalid rate limit config: {0}")]
    InvalidConfig(String),
}

impl RateLimitError {
    /// Check if this error came from procedure registration.
    pub fn is_registration(&self) -> bool {
        matches!(self, Self::Registration(_))
    }

    /// Check if this error is a connectivity loss to the store.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Check if this error is a rejected procedure handle.
    pub fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Check if the store returned an unexpected result shape.
    pub fn is_malformed_result(&self) -> bool {
        matches!(self, Self::MalformedResult(_))
    }

    /// Check if the supplied config failed validation.
    pub fn is_invalid_config(&self) -> bool {
        matches!(self, Self::InvalidConfig(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = RateLimitError::StoreUnavailable("connection refused".into());
        let msg = format!("{}", err);
        assert!(msg.contains("unavailable"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn predicates_cover_all_variants() {
        assert!(RateLimitError::Registration("x".into()).is_registration());
        assert!(RateLimitError::StoreUnavailable("x".into()).is_store_unavailable());
        assert!(RateLimitError::Execution("x".into()).is_execution());
        assert!(RateLimitError::MalformedResult("x".into()).is_malformed_result());
        assert!(RateLimitError::InvalidConfig("x".into()).is_invalid_config());
        assert!(!RateLimitError::Execution("x".into()).is_store_unavailable());
    }
}
