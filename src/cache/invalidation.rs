//! Cache invalidation patterns and events
//!
//! Patterns select entries over the hierarchical key space produced by the
//! key codec:
//! - Exact: a single canonical key
//! - Glob: `*` matches any run of characters, `:` included
//!   (`"posts:*"` matches `"posts:42"` and `"posts:42:comments"`)
//! - Prefix: a structured key and everything below it

use crate::cache::key::{QueryKey, KEY_SEPARATOR};
use crate::cache::types::CacheKey;
use crate::error::{QueryError, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Reason for removing entries from the cache
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationReason {
    /// Entry expired based on TTL
    Expired,

    /// Explicit invalidation by key or pattern
    Manual,

    /// Evicted by LRU policy
    LeastRecentlyUsed,

    /// Restored to its pre-mutation state
    Rollback,
}

impl std::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidationReason::Expired => write!(f, "TTL expired"),
            InvalidationReason::Manual => write!(f, "manual invalidation"),
            InvalidationReason::LeastRecentlyUsed => write!(f, "LRU eviction"),
            InvalidationReason::Rollback => write!(f, "optimistic rollback"),
        }
    }
}

/// Selects a set of cache keys
#[derive(Debug, Clone)]
pub enum InvalidationPattern {
    /// One canonical key
    Exact(CacheKey),

    /// Anchored glob; the original text is kept for logging
    Glob { pattern: String, regex: Regex },

    /// A key and all of its descendants
    Prefix(CacheKey),
}

impl InvalidationPattern {
    /// Parse a pattern string: no `*` means an exact key, otherwise a glob
    pub fn parse(pattern: &str) -> Result<Self> {
        if !pattern.contains('*') {
            return Ok(InvalidationPattern::Exact(pattern.to_string()));
        }

        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("^{}$", body))
            .map_err(|e| QueryError::Validation(format!("invalid pattern {}: {}", pattern, e)))?;

        Ok(InvalidationPattern::Glob {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// Match `key` itself and every key nested below it
    pub fn prefix(key: &QueryKey) -> Self {
        InvalidationPattern::Prefix(key.encode())
    }

    /// Match exactly one structured key
    pub fn exact(key: &QueryKey) -> Self {
        InvalidationPattern::Exact(key.encode())
    }

    /// Check whether a canonical key is selected by this pattern
    pub fn matches(&self, key: &str) -> bool {
        match self {
            InvalidationPattern::Exact(exact) => key == exact,
            InvalidationPattern::Glob { regex, .. } => regex.is_match(key),
            InvalidationPattern::Prefix(prefix) => {
                prefix.is_empty()
                    || key == prefix
                    || (key.starts_with(prefix.as_str())
                        && key[prefix.len()..].starts_with(KEY_SEPARATOR))
            }
        }
    }

    /// The exact key, when this pattern selects a single entry
    pub fn as_exact(&self) -> Option<&str> {
        match self {
            InvalidationPattern::Exact(key) => Some(key),
            _ => None,
        }
    }
}

impl std::fmt::Display for InvalidationPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidationPattern::Exact(key) => write!(f, "{}", key),
            InvalidationPattern::Glob { pattern, .. } => write!(f, "{}", pattern),
            InvalidationPattern::Prefix(prefix) => write!(f, "{}{}**", prefix, KEY_SEPARATOR),
        }
    }
}

/// Record of a bulk removal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationEvent {
    /// Reason for invalidation
    pub reason: InvalidationReason,

    /// When the invalidation occurred
    pub timestamp: DateTime<Utc>,

    /// Keys that were removed
    pub keys: Vec<CacheKey>,

    /// Additional context
    pub context: Option<String>,
}

impl InvalidationEvent {
    /// Create a new invalidation event
    pub fn new(reason: InvalidationReason, keys: Vec<CacheKey>) -> Self {
        Self {
            reason,
            timestamp: Utc::now(),
            keys,
            context: None,
        }
    }

    /// Add context to the event
    pub fn with_context(mut self, context: String) -> Self {
        self.context = Some(context);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;

    #[test]
    fn test_invalidation_reason_display() {
        assert_eq!(InvalidationReason::Expired.to_string(), "TTL expired");
        assert_eq!(InvalidationReason::LeastRecentlyUsed.to_string(), "LRU eviction");
    }

    #[test]
    fn test_exact_pattern() {
        let pattern = InvalidationPattern::parse("posts:1").unwrap();
        assert_eq!(pattern.as_exact(), Some("posts:1"));
        assert!(pattern.matches("posts:1"));
        assert!(!pattern.matches("posts:10"));
    }

    #[test]
    fn test_glob_pattern() {
        let pattern = InvalidationPattern::parse("posts:*").unwrap();
        assert!(pattern.matches("posts:1"));
        assert!(pattern.matches("posts:2:comments"));
        assert!(!pattern.matches("posts"));
        assert!(!pattern.matches("user:1"));
        assert!(!pattern.matches("reposts:1"));
    }

    #[test]
    fn test_glob_in_the_middle() {
        let pattern = InvalidationPattern::parse("user:*:profile").unwrap();
        assert!(pattern.matches("user:1:profile"));
        assert!(!pattern.matches("user:1:settings"));
    }

    #[test]
    fn test_glob_escapes_regex_metacharacters() {
        let pattern = InvalidationPattern::parse("feed.v2:*").unwrap();
        assert!(pattern.matches("feed.v2:home"));
        assert!(!pattern.matches("feedXv2:home"));
    }

    #[test]
    fn test_encoded_key_is_matched_by_glob() {
        let pattern = InvalidationPattern::parse("posts:*").unwrap();
        let id = 42;
        assert!(pattern.matches(&query_key!("posts", id).encode()));
        assert!(pattern.matches(&query_key!("posts", { "id": 42 }).encode()));
    }

    #[test]
    fn test_prefix_pattern() {
        let pattern = InvalidationPattern::prefix(&query_key!("posts", 4));
        assert!(pattern.matches("posts:4"));
        assert!(pattern.matches("posts:4:comments"));
        assert!(!pattern.matches("posts:42"));
        assert!(!pattern.matches("posts"));
    }

    #[test]
    fn test_invalidation_event() {
        let event = InvalidationEvent::new(
            InvalidationReason::Manual,
            vec!["key1".to_string(), "key2".to_string()],
        )
        .with_context("test context".to_string());

        assert_eq!(event.keys.len(), 2);
        assert_eq!(event.context, Some("test context".to_string()));
        assert!(matches!(event.reason, InvalidationReason::Manual));
    }
}
