//! # Ouroboros Query (ouroboros-query)
//!
//! An in-process cache and data-fetching engine for request/response
//! workloads.
//!
//! ## Features
//!
//! - TTL expiry, LRU eviction and glob/prefix invalidation over a shared cache
//! - Request de-duplication: concurrent queries for one key share one fetch
//! - Stale-while-revalidate reads with per-subscriber notifications
//! - Exponential backoff with jitter and pluggable retry classification
//! - Optimistic mutations with exact rollback on failure
//! - Infinite (paginated) queries built on ordinary queries
//! - Write generations, so a slow fetch never overwrites newer data
//!
//! ## Queries
//!
//! ```no_run
//! use ouroboros_query::{query_key, EngineConfig, GlobalQueryState, Query, QueryClient};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = QueryClient::new(EngineConfig::from_env()?, GlobalQueryState::new())?;
//!     client.start();
//!
//!     let post = Query::new(query_key!("posts", 42), || async {
//!         Ok("Hello, world".to_string())
//!     })
//!     .stale_time(Duration::from_secs(30));
//!
//!     let result = client.query(&post).await;
//!     println!("{:?} {:?}", result.status, result.data);
//!     Ok(())
//! }
//! ```
//!
//! ## Mutations
//!
//! ```no_run
//! use ouroboros_query::{query_key, EngineConfig, GlobalQueryState, Mutation, QueryClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = QueryClient::new(EngineConfig::default(), GlobalQueryState::new())?;
//!
//!     let like = Mutation::new(|post_id: u64| async move { Ok(post_id) })
//!         .optimistic(|cache, post_id: &u64| {
//!             cache.update::<u64, _>(query_key!("likes", post_id), |n| Some(n.unwrap_or(0) + 1));
//!         })
//!         .invalidates("feed:*");
//!
//!     let result = client.mutate(&like, 42).await;
//!     assert!(result.is_success());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod fetch;
pub mod mutation;
pub mod pagination;
pub mod query;
pub mod state;

// Re-export main types for convenience
pub use cache::{
    CacheConfig, CacheConfigBuilder, CacheEntry, CacheKey, CacheMetadata, CacheSnapshot,
    CacheStats, CacheStore, InvalidationPattern, KeyCodec, Payload, QueryKey,
};
pub use client::QueryClient;
pub use config::{EngineConfig, QueryDefaults};
pub use error::{QueryError, Result};
pub use fetch::{FetchCoordinator, FetchHandle, RetryPolicy};
pub use mutation::{Mutation, MutationEngine, MutationResult, MutationStatus, OptimisticCache, Rollback};
pub use pagination::{InfiniteQuery, InfiniteQueryOptions, InfiniteQueryResult, PageResult};
pub use query::{Query, QueryEngine, QueryResult, QueryStatus, QuerySubscription};
pub use state::{GlobalQueryState, GlobalSnapshot, Unsubscribe};

#[doc(hidden)]
pub use serde_json as __serde_json;
