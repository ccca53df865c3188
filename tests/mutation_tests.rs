//! Integration tests for mutations
//!
//! These tests verify:
//! - Exact rollback of optimistic updates, absent keys included
//! - Exact rollback when the optimistic write fills a bounded cache
//! - Rollback when the mutation future is abandoned
//! - Invalidation and refetch of observed queries after success

use ouroboros_query::{
    query_key, CacheConfig, EngineConfig, GlobalQueryState, Mutation, MutationStatus, Query,
    QueryClient, QueryDefaults, QueryError, QueryResult,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
struct Post {
    id: u32,
    title: String,
    likes: u32,
}

fn test_client() -> QueryClient {
    QueryClient::new(EngineConfig::default(), GlobalQueryState::new()).unwrap()
}

fn seed(client: &QueryClient) {
    for id in 1..=3 {
        client.queries().set_query_data(
            query_key!("posts", id),
            Post {
                id,
                title: format!("Post {}", id),
                likes: 0,
            },
        );
    }
    client
        .queries()
        .set_query_data(query_key!("posts"), vec![1u32, 2, 3]);
}

#[tokio::test]
async fn test_failed_mutation_restores_exact_cache_state() {
    let client = test_client();
    seed(&client);
    let before = client.cache().snapshot_all();

    let delete = Mutation::new(|_: u32| async { Err::<(), _>(QueryError::http(500, "delete failed")) })
        .optimistic(|cache, id: &u32| {
            cache.remove(query_key!("posts", id));
            cache.update::<Vec<u32>, _>(query_key!("posts"), |ids| {
                ids.map(|ids| ids.into_iter().filter(|i| i != id).collect())
            });
            cache.set(query_key!("trash", id), true);
        });

    let result = client.mutate(&delete, 2).await;

    assert_eq!(result.status, MutationStatus::Error);
    assert!(result.rolled_back);
    assert_eq!(result.error, Some(QueryError::http(500, "delete failed")));
    assert_eq!(client.cache().snapshot_all(), before);
    assert!(!client.cache().contains_key("trash:2"));
}

#[tokio::test]
async fn test_rollback_at_capacity_keeps_untouched_keys() {
    let config = EngineConfig::new(
        CacheConfig::builder().max_entries(2).build(),
        QueryDefaults::default(),
    );
    let client = QueryClient::new(config, GlobalQueryState::new()).unwrap();
    client.queries().set_query_data(query_key!("a"), 1u32);
    client.queries().set_query_data(query_key!("b"), 2u32);
    let before = client.cache().snapshot_all();

    let create = Mutation::new(|_: u32| async { Err::<(), _>(QueryError::http(500, "create failed")) })
        .optimistic(|cache, value: &u32| cache.set(query_key!("c"), *value));

    let result = client.mutate(&create, 3).await;

    assert!(result.rolled_back);
    assert_eq!(client.cache().snapshot_all(), before);
    assert!(client.cache().contains_key("a"));
    assert!(client.cache().contains_key("b"));
    assert_eq!(client.get_stats().evictions, 0);
}

#[tokio::test]
async fn test_successful_mutation_keeps_optimistic_state() {
    let client = test_client();
    seed(&client);

    let like = Mutation::new(|id: u32| async move { Ok(id) }).optimistic(|cache, id: &u32| {
        cache.update::<Post, _>(query_key!("posts", id), |post| {
            post.map(|post| Post {
                likes: post.likes + 1,
                ..post
            })
        });
    });

    let result = client.mutate(&like, 1).await;

    assert!(result.is_success());
    assert!(!result.rolled_back);
    let post = client
        .queries()
        .get_query_data::<Post>(query_key!("posts", 1))
        .unwrap()
        .unwrap();
    assert_eq!(post.likes, 1);
}

#[tokio::test]
async fn test_abandoned_mutation_rolls_back() {
    let client = test_client();
    seed(&client);
    let before = client.cache().snapshot_all();

    let slow = Mutation::new(|_: u32| async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    })
    .optimistic(|cache, id: &u32| cache.remove(query_key!("posts", id)));

    let outcome = tokio::time::timeout(Duration::from_millis(30), client.mutate(&slow, 3)).await;

    assert!(outcome.is_err());
    assert_eq!(client.cache().snapshot_all(), before);
}

#[tokio::test]
async fn test_invalidates_refetches_observed_queries() {
    let client = test_client();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let list = Query::new(query_key!("posts"), move || {
        let counter = counter.clone();
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(vec![n])
        }
    })
    .stale_time(Duration::from_secs(60));

    let _subscription = client
        .queries()
        .subscribe(&list, |_: QueryResult<Vec<u32>>| {});
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let create = Mutation::new(|title: String| async move { Ok(title) }).invalidates("posts*");
    let result = client.mutate(&create, "hello".to_string()).await;
    assert!(result.is_success());

    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        client
            .queries()
            .get_query_data::<Vec<u32>>(query_key!("posts"))
            .unwrap(),
        Some(vec![1])
    );
}

#[tokio::test]
async fn test_failed_mutation_does_not_invalidate() {
    let client = test_client();
    seed(&client);

    let failing = Mutation::new(|_: ()| async { Err::<(), _>(QueryError::Validation("rejected".into())) })
        .invalidates("posts:*");

    let result = client.mutate(&failing, ()).await;

    assert!(result.is_error());
    assert!(!result.rolled_back);
    assert_eq!(client.get_stats().size, 4);
    assert_eq!(
        client.global_state().last_error(),
        Some(QueryError::Validation("rejected".into()))
    );
}

#[tokio::test]
async fn test_mutation_callbacks_receive_variables() {
    let client = test_client();
    let errors = Arc::new(AtomicU32::new(0));
    let sink = errors.clone();

    let mutation = Mutation::new(|id: u32| async move { Err::<u32, _>(QueryError::Network(format!("post {}", id))) })
        .on_success(|_, _| panic!("mutation should not succeed"))
        .on_error(move |error, id: &u32| {
            assert_eq!(error, &QueryError::Network("post 9".into()));
            assert_eq!(*id, 9);
            sink.fetch_add(1, Ordering::SeqCst);
        });

    client.mutate(&mutation, 9).await;

    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(client.global_state().active_count(), 0);
}
