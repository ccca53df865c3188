//! Feed Demo Application
//!
//! Walks through the query client against a simulated, flaky feed backend:
//! de-duplicated queries, stale-while-revalidate, an optimistic "like" that
//! fails and rolls back, and a paginated feed.
//!
//! Usage:
//!   cargo run --example feed_demo
//!
//! Environment variables:
//!   RUST_LOG                         - log filter (default: ouroboros_query=info)
//!   OUROBOROS_QUERY_STALE_TIME_MS    - default stale time for queries
//!   OUROBOROS_QUERY_RETRY_ATTEMPTS   - default query attempts
//!   (see `EngineConfig::from_env` for the full list)

use ouroboros_query::{
    query_key, EngineConfig, GlobalQueryState, InfiniteQueryOptions, Mutation, Query, QueryClient,
    QueryError, RetryPolicy,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone)]
struct Post {
    id: u32,
    title: String,
    likes: u32,
}

/// Simulated backend: every third call fails with a 503
struct FeedBackend {
    calls: AtomicU32,
}

impl FeedBackend {
    async fn post(&self, id: u32) -> Result<Post, QueryError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call % 3 == 0 {
            return Err(QueryError::http(503, "backend overloaded"));
        }
        Ok(Post {
            id,
            title: format!("Post #{}", id),
            likes: 10,
        })
    }

    async fn page(&self, page: u32) -> Result<Vec<u32>, QueryError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok((page * 5..page * 5 + 5).collect())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ouroboros_query=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("=== Query Client Feed Demo ===");

    let global = GlobalQueryState::new();
    let _indicator = global.subscribe(|snapshot| {
        if let Some(error) = &snapshot.last_error {
            info!("  [global] active: {}, last error: {}", snapshot.active_count, error);
        }
    });

    let client = Arc::new(QueryClient::new(EngineConfig::from_env()?, global)?);
    client.start();

    let backend = Arc::new(FeedBackend {
        calls: AtomicU32::new(0),
    });
    let retry = RetryPolicy::new(3)
        .with_base_delay(Duration::from_millis(100))
        .with_jitter(0.2);

    let source = backend.clone();
    let post = Query::new(query_key!("posts", 1), move || {
        let source = source.clone();
        async move { source.post(1).await }
    })
    .stale_time(Duration::from_millis(200))
    .retry(retry);

    info!("\n--- Five concurrent queries, one request ---");
    let results = futures::future::join_all((0..5).map(|_| client.query(&post))).await;
    for result in &results {
        info!("✓ {:?}: {:?}", result.status, result.data.as_ref().map(|p| (p.id, &p.title)));
    }
    info!("Backend calls so far: {}", backend.calls.load(Ordering::SeqCst));

    info!("\n--- Stale-while-revalidate ---");
    tokio::time::sleep(Duration::from_millis(250)).await;
    let stale = client.query(&post).await;
    info!(
        "Served {:?} immediately (stale: {}, refetching: {})",
        stale.data.map(|p| p.likes),
        stale.is_stale,
        stale.is_fetching
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    info!("\n--- Optimistic like with rollback ---");
    let like = Mutation::new(|_: u32| async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        Err::<(), _>(QueryError::http(500, "like rejected"))
    })
    .optimistic(|cache, id: &u32| {
        cache.update::<Post, _>(query_key!("posts", id), |post| {
            post.map(|post| Post {
                likes: post.likes + 1,
                ..post
            })
        });
    })
    .on_error(|error, id: &u32| info!("✗ Like on post {} failed: {}", id, error));

    let outcome = client.mutate(&like, 1).await;
    let likes = client
        .queries()
        .get_query_data::<Post>(query_key!("posts", 1))?
        .map(|p| p.likes);
    info!("Rolled back: {}, likes now: {:?}", outcome.rolled_back, likes);

    info!("\n--- Paginated feed ---");
    let pages = backend.clone();
    let mut feed = client.infinite_query(
        query_key!("feed"),
        move |page: u32| {
            let pages = pages.clone();
            async move { pages.page(page).await }
        },
        InfiniteQueryOptions::new(0u32, |_: &Vec<u32>, all: &[Vec<u32>]| {
            let next = all.len() as u32;
            (next < 3).then_some(next)
        }),
    );

    loop {
        let result = feed.fetch_next_page().await;
        info!("Loaded {} pages: {:?}", result.pages.len(), result.data());
        if !result.has_next_page {
            break;
        }
    }

    let removed = client.invalidate("feed:*")?;
    info!("Invalidated {} feed pages", removed);

    info!("\n{}", client.get_stats());
    client.shutdown();

    Ok(())
}
