//! Structured query keys and their canonical string encoding
//!
//! A query key is an ordered list of JSON values. The codec joins the parts
//! with `:` so that the first parts of a key form a hierarchical path that
//! invalidation patterns such as `"posts:*"` can target.
//!
//! Plain identifier strings are written as-is; everything else is written as
//! canonical JSON. Raw segments never contain the separator and JSON segments
//! are self-delimiting, so two different part lists never encode to the same
//! key:
//!
//! ```
//! use ouroboros_query::{query_key, KeyCodec};
//!
//! assert_eq!(query_key!("posts", 42).encode(), "posts:42");
//! assert_eq!(query_key!("posts", { "id": 42 }).encode(), r#"posts:{"id":42}"#);
//! assert_eq!(query_key!("posts:42").encode(), r#""posts:42""#);
//! assert_eq!(KeyCodec::encode(&[]), "");
//! ```

use crate::cache::types::CacheKey;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Separator between encoded key parts
pub const KEY_SEPARATOR: char = ':';

/// Deterministic key encoder
pub struct KeyCodec;

impl KeyCodec {
    /// Encode an ordered list of parts into a canonical cache key
    pub fn encode(parts: &[Value]) -> CacheKey {
        let mut key = String::new();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                key.push(KEY_SEPARATOR);
            }
            Self::encode_part(part, &mut key);
        }
        key
    }

    fn encode_part(part: &Value, out: &mut String) {
        match part {
            Value::String(s) if Self::is_plain(s) => out.push_str(s),
            // serde_json's default map is ordered by key, so objects are canonical
            other => out.push_str(&other.to_string()),
        }
    }

    /// Whether a string can be written without quoting
    fn is_plain(s: &str) -> bool {
        let mut chars = s.chars();
        let first_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
        first_ok
            && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
            && !matches!(s, "true" | "false" | "null")
    }
}

/// Ordered sequence of key parts identifying a query
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueryKey(Vec<Value>);

impl QueryKey {
    /// Create an empty key
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Create a key from already-converted parts
    pub fn from_parts(parts: Vec<Value>) -> Self {
        Self(parts)
    }

    /// Append a serializable part
    pub fn push<P: Serialize>(&mut self, part: P) -> Result<()> {
        self.0.push(serde_json::to_value(part)?);
        Ok(())
    }

    /// Return a new key extended by one part
    pub fn child<P: Serialize>(&self, part: P) -> Result<Self> {
        let mut child = self.clone();
        child.push(part)?;
        Ok(child)
    }

    /// The parts of this key
    pub fn parts(&self) -> &[Value] {
        &self.0
    }

    /// Number of parts
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key has no parts
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `self` is `other` or an ancestor of it
    pub fn is_prefix_of(&self, other: &QueryKey) -> bool {
        other.0.starts_with(&self.0)
    }

    /// Canonical string form used as the cache key
    pub fn encode(&self) -> CacheKey {
        KeyCodec::encode(&self.0)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl From<&str> for QueryKey {
    fn from(part: &str) -> Self {
        Self(vec![Value::String(part.to_string())])
    }
}

impl From<String> for QueryKey {
    fn from(part: String) -> Self {
        Self(vec![Value::String(part)])
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(parts: Vec<Value>) -> Self {
        Self(parts)
    }
}

impl From<&QueryKey> for QueryKey {
    fn from(key: &QueryKey) -> Self {
        key.clone()
    }
}

/// Build a [`QueryKey`] from a list of JSON-like parts
///
/// Each part accepts anything `serde_json::json!` accepts.
#[macro_export]
macro_rules! query_key {
    ($($part:tt),* $(,)?) => {
        $crate::QueryKey::from_parts(vec![$($crate::__serde_json::json!($part)),*])
    };
}
