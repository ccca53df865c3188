//! Integration tests for query execution through the client
//!
//! These tests verify:
//! - Request de-duplication across concurrent callers
//! - Stale-while-revalidate reads
//! - Write generations guarding against slow fetches
//! - Awaited queries keep their value when invalidation discards it
//! - Retry with backoff and error classification
//! - Global activity tracking

use ouroboros_query::{
    query_key, CacheConfig, EngineConfig, GlobalQueryState, Query, QueryClient, QueryDefaults,
    QueryError, QueryResult, QueryStatus, RetryPolicy,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn test_client() -> QueryClient {
    let config = EngineConfig::new(
        CacheConfig::builder()
            .default_ttl(Duration::from_secs(60))
            .enable_auto_cleanup(false)
            .build(),
        QueryDefaults {
            retry_attempts: 1,
            ..Default::default()
        },
    );
    QueryClient::new(config, GlobalQueryState::new()).unwrap()
}

fn slow_counted(calls: &Arc<AtomicU32>, delay: Duration, value: &'static str) -> Query<String> {
    let calls = calls.clone();
    Query::new(query_key!("posts", 1), move || {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok(value.to_string())
        }
    })
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts)
        .with_base_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(20))
        .with_jitter(0.0)
}

#[tokio::test]
async fn test_concurrent_queries_share_one_fetch() {
    let client = Arc::new(test_client());
    let calls = Arc::new(AtomicU32::new(0));
    let query = slow_counted(&calls, Duration::from_millis(50), "post");

    let results = futures::future::join_all((0..10).map(|_| {
        let client = client.clone();
        let query = query.clone();
        async move { client.query(&query).await }
    }))
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in results {
        assert_eq!(result.status, QueryStatus::Success);
        assert_eq!(result.data.as_deref(), Some("post"));
    }
    assert_eq!(client.queries().coordinator().in_flight_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_queries_from_spawned_tasks() {
    let client = Arc::new(test_client());
    let calls = Arc::new(AtomicU32::new(0));
    let query = slow_counted(&calls, Duration::from_millis(50), "post");

    let mut handles = vec![];
    for _ in 0..10 {
        let client = client.clone();
        let query = query.clone();
        handles.push(tokio::spawn(async move { client.query(&query).await }));
    }

    for handle in handles {
        let result = handle.await.unwrap();
        assert_eq!(result.data.as_deref(), Some("post"));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stale_while_revalidate() {
    let client = test_client();
    let calls = Arc::new(AtomicU32::new(0));
    let query = slow_counted(&calls, Duration::from_millis(20), "post").stale_time(Duration::ZERO);

    let first = client.query(&query).await;
    assert_eq!(first.status, QueryStatus::Success);

    // Stale immediately: served from cache while a refetch runs
    let second = client.query(&query).await;
    assert_eq!(second.data.as_deref(), Some("post"));
    assert!(second.is_stale);
    assert!(second.is_fetching);
    assert_eq!(second.status, QueryStatus::Success);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(!client.global_state().is_fetching());
}

#[tokio::test]
async fn test_slow_fetch_does_not_overwrite_newer_write() {
    let client = Arc::new(test_client());
    let calls = Arc::new(AtomicU32::new(0));
    let query = slow_counted(&calls, Duration::from_millis(80), "from server");

    let background = {
        let client = client.clone();
        let query = query.clone();
        tokio::spawn(async move { client.queries().refetch(&query).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    client
        .queries()
        .set_query_data(query_key!("posts", 1), "written locally".to_string());

    let result = background.await.unwrap();

    assert_eq!(result.data.as_deref(), Some("written locally"));
    assert_eq!(
        client
            .queries()
            .get_query_data::<String>(query_key!("posts", 1))
            .unwrap(),
        Some("written locally".to_string())
    );
}

#[tokio::test]
async fn test_invalidate_discards_in_flight_result() {
    let client = Arc::new(test_client());
    let calls = Arc::new(AtomicU32::new(0));
    let query = slow_counted(&calls, Duration::from_millis(60), "outdated");

    let background = {
        let client = client.clone();
        let query = query.clone();
        tokio::spawn(async move { client.query(&query).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    client.invalidate("posts:*").unwrap();
    let awaited = background.await.unwrap();

    // The waiting caller still gets its value; the cache does not
    assert_eq!(awaited.status, QueryStatus::Success);
    assert_eq!(awaited.data.as_deref(), Some("outdated"));
    assert!(awaited.is_stale);
    assert!(!client.cache().contains_key("posts:1"));

    // The next query starts a fresh request
    let result = client.query(&query).await;
    assert_eq!(result.status, QueryStatus::Success);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_query_racing_invalidation_returns_fetched_value() {
    let client = Arc::new(test_client());
    let calls = Arc::new(AtomicU32::new(0));
    let query = slow_counted(&calls, Duration::from_millis(50), "post");

    let invalidator = {
        let client = client.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            client.invalidate("posts:*").unwrap()
        })
    };

    let result = client.query(&query).await;
    invalidator.await.unwrap();

    assert_eq!(result.status, QueryStatus::Success);
    assert_eq!(result.data.as_deref(), Some("post"));
    assert!(result.error.is_none());
    assert!(!client.cache().contains_key("posts:1"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.queries().tracked_keys(), 0);
}

#[tokio::test]
async fn test_retry_until_success() {
    let client = test_client();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let query = Query::new(query_key!("flaky"), move || {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(QueryError::http(503, "unavailable"))
            } else {
                Ok(7u32)
            }
        }
    })
    .retry(fast_retry(3));

    let result = client.query(&query).await;

    assert_eq!(result.status, QueryStatus::Success);
    assert_eq!(result.data, Some(7));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_non_retryable_error_fails_fast() {
    let client = test_client();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let query = Query::new(query_key!("missing"), move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<u32, _>(QueryError::http(404, "not found"))
        }
    })
    .retry(fast_retry(5));

    let result = client.query(&query).await;

    assert_eq!(result.status, QueryStatus::Error);
    assert_eq!(result.error, Some(QueryError::http(404, "not found")));
    assert!(result.data.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_timeout_counts_as_failed_attempt() {
    let client = test_client();
    let calls = Arc::new(AtomicU32::new(0));
    let query = slow_counted(&calls, Duration::from_millis(200), "late")
        .timeout(Duration::from_millis(20))
        .retry(fast_retry(2));

    let result = client.query(&query).await;

    assert_eq!(result.status, QueryStatus::Error);
    assert!(matches!(result.error, Some(QueryError::Timeout { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_callbacks_fire_once_per_fetch() {
    let client = Arc::new(test_client());
    let calls = Arc::new(AtomicU32::new(0));
    let successes = Arc::new(AtomicU32::new(0));
    let settled = Arc::new(AtomicU32::new(0));

    let on_success = successes.clone();
    let on_settled = settled.clone();
    let query = slow_counted(&calls, Duration::from_millis(30), "post")
        .on_success(move |_| {
            on_success.fetch_add(1, Ordering::SeqCst);
        })
        .on_settled(move |data, error| {
            assert!(data.is_some());
            assert!(error.is_none());
            on_settled.fetch_add(1, Ordering::SeqCst);
        });

    futures::future::join_all((0..5).map(|_| client.query(&query))).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(successes.load(Ordering::SeqCst), 1);
    assert_eq!(settled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_global_state_tracks_activity_and_errors() {
    let client = test_client();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _listener = client
        .global_state()
        .subscribe(move |snapshot| sink.lock().push(snapshot.active_count));

    let calls = Arc::new(AtomicU32::new(0));
    client
        .query(&slow_counted(&calls, Duration::from_millis(20), "post"))
        .await;

    {
        let seen = seen.lock();
        assert!(seen.contains(&1));
        assert_eq!(seen.last(), Some(&0));
    }

    let failing = Query::new(query_key!("broken"), || async {
        Err::<u32, _>(QueryError::Validation("bad request".into()))
    });
    client.query(&failing).await;

    assert_eq!(
        client.global_state().last_error(),
        Some(QueryError::Validation("bad request".into()))
    );
    assert_eq!(client.global_state().active_count(), 0);

    client.global_state().clear_error();
    assert!(client.global_state().snapshot().last_error.is_none());
}

#[tokio::test]
async fn test_subscription_sees_loading_then_success() {
    let client = test_client();
    let calls = Arc::new(AtomicU32::new(0));
    let query = slow_counted(&calls, Duration::from_millis(20), "post");

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = statuses.clone();
    let subscription = client
        .queries()
        .subscribe(&query, move |result: QueryResult<String>| sink.lock().push(result.status));

    tokio::time::sleep(Duration::from_millis(60)).await;

    let statuses = statuses.lock().clone();
    assert_eq!(statuses.first(), Some(&QueryStatus::Loading));
    assert_eq!(statuses.last(), Some(&QueryStatus::Success));
    assert_eq!(subscription.key(), "posts:1");
}

#[tokio::test]
async fn test_structured_keys_are_isolated() {
    let client = test_client();

    let by_number = Query::new(query_key!("posts", 42), || async { Ok("number") });
    let by_string = Query::new(query_key!("posts", "42"), || async { Ok("string") });
    let by_object = Query::new(query_key!("posts", { "id": 42 }), || async { Ok("object") });

    assert_eq!(client.query(&by_number).await.data, Some("number"));
    assert_eq!(client.query(&by_string).await.data, Some("string"));
    assert_eq!(client.query(&by_object).await.data, Some("object"));
    assert_eq!(client.get_stats().size, 3);
}
