//! Error types for query and cache operations
//!
//! Fetch-level failures are classified here so the retry policy can decide
//! whether another attempt is worthwhile. Errors are `Clone` because a single
//! fetch result is shared by every caller that joined it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the query engine
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryError {
    /// Transport-level failure (connection refused, reset, DNS)
    #[error("Network error: {0}")]
    Network(String),

    /// Upstream answered with a non-success HTTP status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Request rejected as invalid; retrying will not help
    #[error("Validation error: {0}")]
    Validation(String),

    /// A single attempt exceeded its deadline
    #[error("Operation timed out after {timeout_ms}ms: {context}")]
    Timeout { timeout_ms: u64, context: String },

    /// Internal invariant violation in the cache layer
    #[error("Cache consistency error: {0}")]
    CacheConsistency(String),

    /// The fetch was abandoned before producing a result
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

impl QueryError {
    /// Whether the default retry classifier should try again after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            QueryError::Network(_) | QueryError::Timeout { .. } => true,
            QueryError::Http { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            QueryError::Validation(_)
            | QueryError::CacheConsistency(_)
            | QueryError::Cancelled(_)
            | QueryError::Config(_)
            | QueryError::Other(_) => false,
        }
    }

    /// Fatal errors indicate a bug and are never recovered from by retrying
    pub fn is_fatal(&self) -> bool {
        matches!(self, QueryError::CacheConsistency(_))
    }

    /// Shorthand for an HTTP status error
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        QueryError::Http {
            status,
            message: message.into(),
        }
    }
}

/// Result type alias for query operations
pub type Result<T> = std::result::Result<T, QueryError>;

impl From<String> for QueryError {
    fn from(s: String) -> Self {
        QueryError::Other(s)
    }
}

impl From<&str> for QueryError {
    fn from(s: &str) -> Self {
        QueryError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(e: serde_json::Error) -> Self {
        QueryError::Validation(format!("key part is not serializable: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = QueryError::Network("connection reset".to_string());
        assert_eq!(error.to_string(), "Network error: connection reset");

        let timeout_error = QueryError::Timeout {
            timeout_ms: 250,
            context: "posts:1".to_string(),
        };
        assert!(timeout_error.to_string().contains("timed out after 250ms"));

        let http = QueryError::http(503, "unavailable");
        assert_eq!(http.to_string(), "HTTP 503: unavailable");
    }

    #[test]
    fn test_retry_classification() {
        assert!(QueryError::Network("x".into()).is_retryable());
        assert!(QueryError::Timeout {
            timeout_ms: 1,
            context: String::new()
        }
        .is_retryable());
        assert!(QueryError::http(502, "bad gateway").is_retryable());
        assert!(QueryError::http(429, "slow down").is_retryable());
        assert!(!QueryError::http(404, "missing").is_retryable());
        assert!(!QueryError::Validation("bad".into()).is_retryable());
        assert!(!QueryError::CacheConsistency("bug".into()).is_retryable());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(QueryError::CacheConsistency("type mismatch".into()).is_fatal());
        assert!(!QueryError::Network("x".into()).is_fatal());
    }

    #[test]
    fn test_error_conversion() {
        let error: QueryError = "test error".into();
        assert!(matches!(error, QueryError::Other(_)));

        let error: QueryError = "test error".to_string().into();
        assert!(matches!(error, QueryError::Other(_)));
    }
}
