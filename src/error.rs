//! Error types for the limiter core and the tower adapter.
use std::fmt;
use std::sync::Arc;

use crate::bucket::BucketError;

/// Result alias for limiter operations.
pub type LimiterResult<T> = Result<T, LimiterError>;

/// Failure reported by a key-value or durable store backend.
///
/// Backends build these from their native errors; the core never inspects them
/// beyond logging and propagating.
#[derive(Debug, Clone)]
pub struct StoreError {
    message: String,
    source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl StoreError {
    /// Create an error from a plain message.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), source: None }
    }

    /// Wrap a backend error, keeping it reachable through `source()`.
    pub fn from_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// The message given at construction.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {}", self.message, source),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::from_source("bucket serialization failed", err)
    }
}

/// Errors surfaced by [`BucketManager`](crate::BucketManager) operations.
///
/// A denied take is not an error; it is `Ok(false)`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LimiterError {
    /// The key-value store or durable store could not be reached or timed out.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    /// A stored field could not be coerced back into a bucket attribute.
    #[error("malformed bucket state at '{key}': field '{field}' = {value:?}")]
    MalformedBucketState {
        /// Store key of the offending hash.
        key: String,
        /// Field that failed coercion.
        field: &'static str,
        /// Raw stored value (empty when the field was missing).
        value: String,
    },
    /// No limits exist for the resource and the configuration rejects unknown resources.
    #[error("no limits configured for resource '{resource}'")]
    UnknownResource {
        /// Resource that was requested.
        resource: String,
    },
    /// Bucket parameters failed validation.
    #[error("invalid bucket parameters: {0}")]
    InvalidBucket(#[from] BucketError),
    /// `take` was asked for zero tokens.
    #[error("take count must be > 0")]
    InvalidCount,
    /// The cache entry disappeared on every atomic take attempt.
    #[error("bucket '{key}' was evicted during take on all {attempts} attempts")]
    Contention {
        /// Store key of the bucket.
        key: String,
        /// Attempts made before giving up.
        attempts: u32,
    },
}

impl LimiterError {
    /// Check if this error came from an unreachable store.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Check if this error is a stored-state coercion failure.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedBucketState { .. })
    }
}

/// Error returned by [`QuotaService`](crate::middleware::QuotaService).
#[derive(Debug, Clone)]
pub enum QuotaError<E> {
    /// The bucket had no tokens left.
    Denied { owner: String, resource: String },
    /// The request carried no resolvable owner; the limiter was not consulted.
    MissingOwner,
    /// The limiter itself failed (store down, bad config).
    Limiter(LimiterError),
    /// The wrapped service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for QuotaError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Denied { owner, resource } => {
                write!(f, "quota exhausted for owner '{}' on '{}'", owner, resource)
            }
            Self::MissingOwner => write!(f, "request has no owner"),
            Self::Limiter(e) => write!(f, "rate limiter failed: {}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for QuotaError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Limiter(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> QuotaError<E> {
    /// Check if the request was rejected for lack of tokens.
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied { .. })
    }

    /// Check if the request was rejected before reaching the limiter.
    pub fn is_missing_owner(&self) -> bool {
        matches!(self, Self::MissingOwner)
    }

    /// Borrow the limiter failure, if any.
    pub fn as_limiter(&self) -> Option<&LimiterError> {
        match self {
            Self::Limiter(e) => Some(e),
            _ => None,
        }
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io;

    #[test]
    fn store_error_keeps_source() {
        let err = StoreError::from_source("hgetall failed", io::Error::new(io::ErrorKind::Other, "refused"));
        assert_eq!(err.message(), "hgetall failed");
        assert!(err.to_string().contains("refused"));
        assert!(err.source().is_some());
        assert!(StoreError::new("plain").source().is_none());
    }

    #[test]
    fn store_unavailable_wraps_store_error() {
        let err: LimiterError = StoreError::new("timeout").into();
        assert!(err.is_store_unavailable());
        assert!(err.to_string().contains("timeout"));
        assert!(err.source().is_some());
    }

    #[test]
    fn malformed_display_names_field() {
        let err = LimiterError::MalformedBucketState {
            key: "ratekeeper:o:r".into(),
            field: "token",
            value: "abc".into(),
        };
        assert!(err.is_malformed());
        let msg = err.to_string();
        assert!(msg.contains("token"));
        assert!(msg.contains("abc"));
    }

    #[test]
    fn quota_error_predicates() {
        let denied: QuotaError<io::Error> =
            QuotaError::Denied { owner: "o".into(), resource: "r".into() };
        assert!(denied.is_denied());
        assert!(denied.to_string().contains("'r'"));

        let missing: QuotaError<io::Error> = QuotaError::MissingOwner;
        assert!(missing.is_missing_owner());
        assert!(missing.source().is_none());

        let limiter: QuotaError<io::Error> = QuotaError::Limiter(LimiterError::InvalidCount);
        assert!(matches!(limiter.as_limiter(), Some(LimiterError::InvalidCount)));

        let inner = QuotaError::Inner(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(inner.into_inner().unwrap().to_string(), "boom");
    }
}
