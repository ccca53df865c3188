//! # Query Cache Layer
//!
//! Shared in-memory store for query results, keyed by canonical strings
//! produced from structured query keys.
//!
//! ## Features
//!
//! - **TTL-Based Expiration**: Entries become invisible once their deadline
//!   passes and are reclaimed by a background sweep
//! - **LRU Eviction**: Least Recently Used entries are dropped once
//!   `max_entries` is exceeded
//! - **Pattern Invalidation**: `"posts:*"` removes a whole key subtree
//! - **Write Generations**: Every write is stamped from a store-wide clock so
//!   late fetch results can be discarded
//! - **Snapshots**: Exact capture and restore of a set of keys
//!
//! ## Example
//!
//! ```rust
//! use ouroboros_query::cache::{CacheConfig, CacheStore};
//! use std::time::Duration;
//!
//! let config = CacheConfig::builder()
//!     .default_ttl(Duration::from_secs(60))
//!     .max_entries(1_000)
//!     .build();
//!
//! let cache: CacheStore<String> = CacheStore::new(config);
//!
//! cache.set("posts:1", "hello".to_string(), Duration::from_secs(30));
//! assert_eq!(cache.get("posts:1"), Some("hello".to_string()));
//!
//! cache.invalidate("posts:*").unwrap();
//! assert!(cache.get("posts:1").is_none());
//! ```

pub mod config;
pub mod entry;
pub mod invalidation;
pub mod key;
pub mod store;
pub mod types;

pub use config::{CacheConfig, CacheConfigBuilder};
pub use entry::{CacheEntry, CacheMetadata};
pub use invalidation::{InvalidationEvent, InvalidationPattern, InvalidationReason};
pub use key::{KeyCodec, QueryKey, KEY_SEPARATOR};
pub use store::{start_auto_cleanup, CacheSnapshot, CacheStore, SnapshotEntry};
pub use types::{CacheKey, CacheStats, Payload};
