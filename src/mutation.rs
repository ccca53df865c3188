//! Mutations with optimistic updates and exact rollback
//!
//! An optimistic update writes through an [`OptimisticCache`], which records
//! the state every key had before its first write. The recording becomes a
//! [`Rollback`]: committed on success, restored on failure, and restored on
//! drop if the mutation future is abandoned half-way.

use crate::cache::{CacheKey, CacheSnapshot, CacheStore, Payload, QueryKey};
use crate::error::{QueryError, Result};
use crate::fetch::{execute_with_retry, RetryPolicy};
use crate::query::QueryEngine;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type MutationFn<V, T> = Arc<dyn Fn(V) -> BoxFuture<'static, Result<T>> + Send + Sync>;
pub type OptimisticFn<V> = Arc<dyn Fn(&mut OptimisticCache, &V) + Send + Sync>;
pub type ConfirmFn<V, T> = Arc<dyn Fn(&mut OptimisticCache, &T, &V) + Send + Sync>;

/// Cache writer that records prior state for rollback
pub struct OptimisticCache {
    cache: Arc<CacheStore<Payload>>,
    ttl: Duration,
    snapshot: CacheSnapshot<Payload>,
}

impl OptimisticCache {
    pub(crate) fn new(cache: Arc<CacheStore<Payload>>, ttl: Duration) -> Self {
        Self {
            cache,
            ttl,
            snapshot: CacheSnapshot::empty(),
        }
    }

    fn record(&mut self, key: &CacheKey) {
        if !self.snapshot.contains(key) {
            let saved = self.cache.snapshot(std::slice::from_ref(key));
            self.snapshot.merge(saved);
        }
    }

    /// Typed read; a value of another type reads as `None`
    pub fn get<T>(&self, key: impl Into<QueryKey>) -> Option<T>
    where
        T: Clone + 'static,
    {
        let key = key.into().encode();
        self.cache.peek(&key)?.value.downcast::<T>()
    }

    pub fn set<T>(&mut self, key: impl Into<QueryKey>, value: T)
    where
        T: Send + Sync + 'static,
    {
        let key = key.into().encode();
        self.record(&key);
        // Evicting here would drop untouched keys that no rollback can restore
        self.cache.set_without_eviction(key, Payload::new(value), self.ttl);
    }

    /// Replace a value with `f(current)`; returning `None` removes the key
    pub fn update<T, F>(&mut self, key: impl Into<QueryKey>, f: F)
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(Option<T>) -> Option<T>,
    {
        let key = key.into();
        let current = self.get::<T>(&key);
        match f(current) {
            Some(next) => self.set(key, next),
            None => self.remove(key),
        }
    }

    pub fn remove(&mut self, key: impl Into<QueryKey>) {
        let key = key.into().encode();
        self.record(&key);
        self.cache.remove(&key);
    }

    /// Keys written so far
    pub fn touched(&self) -> Vec<CacheKey> {
        self.snapshot.keys().cloned().collect()
    }

    pub fn into_rollback(self) -> Rollback {
        Rollback {
            cache: self.cache,
            snapshot: Some(self.snapshot),
        }
    }
}

/// Exact prior state of every key an optimistic update touched
///
/// Restores that state when dropped unless [`commit`](Self::commit) or
/// [`restore`](Self::restore) was called first.
#[must_use = "dropping a Rollback restores the cache immediately"]
pub struct Rollback {
    cache: Arc<CacheStore<Payload>>,
    snapshot: Option<CacheSnapshot<Payload>>,
}

impl Rollback {
    pub fn keys(&self) -> Vec<CacheKey> {
        self.snapshot
            .as_ref()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Put every touched key back; returns the restored keys
    pub fn restore(mut self) -> Vec<CacheKey> {
        match self.snapshot.take() {
            Some(snapshot) => self.cache.restore(&snapshot),
            None => Vec::new(),
        }
    }

    /// Keep the optimistic state
    ///
    /// Eviction deferred by the optimistic writes runs now.
    pub fn commit(mut self) {
        self.snapshot = None;
        self.cache.evict_if_needed();
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            warn!(
                "Mutation abandoned before settling, restoring {} keys",
                snapshot.len()
            );
            self.cache.restore(&snapshot);
        }
    }
}

/// Per-invocation state of a mutation
pub struct MutationContext<V> {
    pub id: Uuid,
    pub variables: V,
    pub attempts: u32,
    pub rollback: Option<Rollback>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationStatus {
    Success,
    Error,
}

/// Outcome of [`MutationEngine::execute`]
#[derive(Debug, Clone, PartialEq)]
pub struct MutationResult<T> {
    pub id: Uuid,
    pub status: MutationStatus,
    pub data: Option<T>,
    pub error: Option<QueryError>,

    /// Attempts made, the first one included
    pub attempts: u32,

    /// An optimistic update was undone
    pub rolled_back: bool,
}

impl<T> MutationResult<T> {
    pub fn is_success(&self) -> bool {
        self.status == MutationStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == MutationStatus::Error
    }
}

/// A server-side write and what to do with the cache around it
pub struct Mutation<V, T> {
    mutation_fn: MutationFn<V, T>,
    retry: Option<RetryPolicy>,
    timeout: Option<Duration>,
    optimistic: Option<OptimisticFn<V>>,
    confirm: Option<ConfirmFn<V, T>>,
    invalidates: Vec<String>,
    on_success: Option<Arc<dyn Fn(&T, &V) + Send + Sync>>,
    on_error: Option<Arc<dyn Fn(&QueryError, &V) + Send + Sync>>,
    on_settled: Option<Arc<dyn Fn(Option<&T>, Option<&QueryError>, &V) + Send + Sync>>,
}

impl<V, T> Mutation<V, T>
where
    V: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(mutation_fn: F) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            mutation_fn: Arc::new(move |variables| mutation_fn(variables).boxed()),
            retry: None,
            timeout: None,
            optimistic: None,
            confirm: None,
            invalidates: Vec::new(),
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }

    /// Retry policy; mutations do not retry by default
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Apply a speculative update before the call
    pub fn optimistic<F>(mut self, update: F) -> Self
    where
        F: Fn(&mut OptimisticCache, &V) + Send + Sync + 'static,
    {
        self.optimistic = Some(Arc::new(update));
        self
    }

    /// Write server-authoritative data after success
    pub fn confirm<F>(mut self, confirm: F) -> Self
    where
        F: Fn(&mut OptimisticCache, &T, &V) + Send + Sync + 'static,
    {
        self.confirm = Some(Arc::new(confirm));
        self
    }

    /// Invalidate `pattern` after success
    pub fn invalidates(mut self, pattern: impl Into<String>) -> Self {
        self.invalidates.push(pattern.into());
        self
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&T, &V) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&QueryError, &V) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn on_settled<F>(mut self, callback: F) -> Self
    where
        F: Fn(Option<&T>, Option<&QueryError>, &V) + Send + Sync + 'static,
    {
        self.on_settled = Some(Arc::new(callback));
        self
    }
}

/// Runs mutations against the query engine's cache
#[derive(Clone)]
pub struct MutationEngine {
    queries: QueryEngine,
}

impl MutationEngine {
    pub fn new(queries: QueryEngine) -> Self {
        Self { queries }
    }

    /// Execute a mutation
    ///
    /// The optimistic update, if any, runs synchronously before the first
    /// attempt. If every attempt fails the touched keys are restored exactly
    /// before `on_error` runs.
    pub async fn execute<V, T>(&self, mutation: &Mutation<V, T>, variables: V) -> MutationResult<T>
    where
        V: Clone + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
    {
        let defaults = self.queries.defaults();
        let _activity = self.queries.global().begin();

        let mut context = MutationContext {
            id: Uuid::new_v4(),
            variables,
            attempts: 0,
            rollback: None,
        };
        debug!("Starting mutation {}", context.id);

        if let Some(optimistic) = &mutation.optimistic {
            let mut cache = OptimisticCache::new(self.queries.cache().clone(), defaults.cache_time);
            optimistic(&mut cache, &context.variables);
            let rollback = cache.into_rollback();
            self.notify_all(&rollback.keys());
            context.rollback = Some(rollback);
        }

        let label = format!("mutation {}", context.id);
        let policy = match &mutation.retry {
            Some(retry) => retry.clone().or_valid(|| defaults.mutation_retry(), &label),
            None => defaults.mutation_retry(),
        };
        let timeout = mutation.timeout.or(defaults.request_timeout);

        let outcome = execute_with_retry(
            || (mutation.mutation_fn)(context.variables.clone()),
            &policy,
            timeout,
            &label,
            || true,
        )
        .await;
        context.attempts = outcome.attempts;

        match outcome.result {
            Ok(data) => self.succeed(mutation, context, data),
            Err(error) => self.fail(mutation, context, error),
        }
    }

    fn succeed<V, T>(&self, mutation: &Mutation<V, T>, mut context: MutationContext<V>, data: T) -> MutationResult<T>
    where
        V: Clone + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
    {
        if let Some(rollback) = context.rollback.take() {
            rollback.commit();
        }

        if let Some(confirm) = &mutation.confirm {
            let mut cache =
                OptimisticCache::new(self.queries.cache().clone(), self.queries.defaults().cache_time);
            confirm(&mut cache, &data, &context.variables);
            let confirmed = cache.into_rollback();
            self.notify_all(&confirmed.keys());
            confirmed.commit();
        }

        for pattern in &mutation.invalidates {
            match self.queries.invalidate(pattern) {
                Ok(removed) => debug!("Mutation {} invalidated {} entries matching {}", context.id, removed, pattern),
                Err(error) => warn!("Mutation {} has an invalid pattern {}: {}", context.id, pattern, error),
            }
        }

        if let Some(callback) = &mutation.on_success {
            callback(&data, &context.variables);
        }
        if let Some(callback) = &mutation.on_settled {
            callback(Some(&data), None, &context.variables);
        }

        info!("Mutation {} succeeded after {} attempts", context.id, context.attempts);

        MutationResult {
            id: context.id,
            status: MutationStatus::Success,
            data: Some(data),
            error: None,
            attempts: context.attempts,
            rolled_back: false,
        }
    }

    fn fail<V, T>(&self, mutation: &Mutation<V, T>, mut context: MutationContext<V>, error: QueryError) -> MutationResult<T>
    where
        V: Clone + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
    {
        let rolled_back = match context.rollback.take() {
            Some(rollback) => {
                let restored = rollback.restore();
                debug!("Mutation {} rolled back {} keys", context.id, restored.len());
                self.notify_all(&restored);
                true
            }
            None => false,
        };

        warn!("Mutation {} failed after {} attempts: {}", context.id, context.attempts, error);
        self.queries.global().record_error(error.clone());

        if let Some(callback) = &mutation.on_error {
            callback(&error, &context.variables);
        }
        if let Some(callback) = &mutation.on_settled {
            callback(None, Some(&error), &context.variables);
        }

        MutationResult {
            id: context.id,
            status: MutationStatus::Error,
            data: None,
            error: Some(error),
            attempts: context.attempts,
            rolled_back,
        }
    }

    fn notify_all(&self, keys: &[CacheKey]) {
        for key in keys {
            self.queries.notify(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::config::QueryDefaults;
    use crate::query_key;
    use crate::state::GlobalQueryState;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine() -> MutationEngine {
        MutationEngine::new(QueryEngine::new(
            Arc::new(CacheStore::new(CacheConfig::default())),
            GlobalQueryState::new(),
            QueryDefaults::default(),
        ))
    }

    #[test]
    fn test_optimistic_cache_records_first_state_only() {
        let cache = Arc::new(CacheStore::new(CacheConfig::default()));
        cache.set("likes", Payload::new(1u32), Duration::from_secs(60));
        let before = cache.snapshot(&["likes".to_string(), "new".to_string()]);

        let mut optimistic = OptimisticCache::new(cache.clone(), Duration::from_secs(60));
        optimistic.set("likes", 2u32);
        optimistic.set("likes", 3u32);
        optimistic.set("new", "x".to_string());
        assert_eq!(optimistic.get::<u32>("likes"), Some(3));

        let rollback = optimistic.into_rollback();
        assert_eq!(rollback.keys(), vec!["likes".to_string(), "new".to_string()]);
        rollback.restore();

        assert_eq!(cache.snapshot(&["likes".to_string(), "new".to_string()]), before);
    }

    #[test]
    fn test_rollback_at_capacity_keeps_untouched_keys() {
        let cache = Arc::new(CacheStore::new(CacheConfig::builder().max_entries(2).build()));
        cache.set("a", Payload::new(1u32), Duration::from_secs(60));
        cache.set("b", Payload::new(2u32), Duration::from_secs(60));
        let before = cache.snapshot_all();

        let mut optimistic = OptimisticCache::new(cache.clone(), Duration::from_secs(60));
        optimistic.set("c", 3u32);
        assert_eq!(cache.len(), 3);

        optimistic.into_rollback().restore();

        assert_eq!(cache.snapshot_all(), before);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_commit_applies_deferred_eviction() {
        let cache = Arc::new(CacheStore::new(CacheConfig::builder().max_entries(2).build()));
        cache.set("a", Payload::new(1u32), Duration::from_secs(60));
        cache.set("b", Payload::new(2u32), Duration::from_secs(60));

        let mut optimistic = OptimisticCache::new(cache.clone(), Duration::from_secs(60));
        optimistic.set("c", 3u32);
        optimistic.into_rollback().commit();

        assert_eq!(cache.len(), 2);
        assert!(cache.peek("a").is_none());
        assert!(cache.peek("c").is_some());
    }

    #[test]
    fn test_dropped_rollback_restores() {
        let cache = Arc::new(CacheStore::new(CacheConfig::default()));
        let mut optimistic = OptimisticCache::new(cache.clone(), Duration::from_secs(60));
        optimistic.set("draft", 1u8);

        drop(optimistic.into_rollback());

        assert!(cache.peek("draft").is_none());
    }

    #[tokio::test]
    async fn test_success_keeps_optimistic_value_and_runs_callbacks() {
        let engine = engine();
        let settled = Arc::new(AtomicU32::new(0));
        let counter = settled.clone();

        let mutation = Mutation::new(|title: String| async move { Ok(title.len()) })
            .optimistic(|cache, title: &String| cache.set(query_key!("title"), title.clone()))
            .on_settled(move |data, error, _| {
                assert_eq!(data, Some(&5));
                assert!(error.is_none());
                counter.fetch_add(1, Ordering::SeqCst);
            });

        let result = engine.execute(&mutation, "hello".to_string()).await;

        assert!(result.is_success());
        assert_eq!(result.data, Some(5));
        assert_eq!(result.attempts, 1);
        assert!(!result.rolled_back);
        assert_eq!(
            engine.queries.get_query_data::<String>(query_key!("title")).unwrap(),
            Some("hello".to_string())
        );
        assert_eq!(settled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_rolls_back_before_on_error() {
        let engine = engine();
        engine.queries.set_query_data(query_key!("count"), 10u32);
        let before = engine.queries.cache().snapshot_all();

        let cache = engine.queries.cache().clone();
        let mutation = Mutation::new(|_: u32| async { Err::<(), _>(QueryError::http(500, "boom")) })
            .optimistic(|cache, delta: &u32| {
                cache.update::<u32, _>(query_key!("count"), |n| n.map(|n| n + delta));
            })
            .on_error(move |_, _| {
                let restored = cache.peek("count").and_then(|e| e.value.downcast::<u32>());
                assert_eq!(restored, Some(10));
            });

        let result = engine.execute(&mutation, 5).await;

        assert!(result.is_error());
        assert!(result.rolled_back);
        assert_eq!(engine.queries.cache().snapshot_all(), before);
        assert!(engine.queries.global().last_error().is_some());
    }

    #[tokio::test]
    async fn test_confirm_writes_server_data() {
        let engine = engine();

        let mutation = Mutation::new(|id: u32| async move { Ok(format!("post-{}", id)) })
            .optimistic(|cache, id: &u32| cache.set(query_key!("posts", id), "pending".to_string()))
            .confirm(|cache, data: &String, id: &u32| cache.set(query_key!("posts", id), data.clone()));

        let result = engine.execute(&mutation, 7).await;

        assert!(result.is_success());
        assert_eq!(
            engine.queries.get_query_data::<String>(query_key!("posts", 7)).unwrap(),
            Some("post-7".to_string())
        );
    }

    #[tokio::test]
    async fn test_mutation_retry_is_opt_in() {
        let engine = engine();
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let mutation = Mutation::new(move |_: ()| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(QueryError::Network("down".into()))
            }
        });
        assert_eq!(engine.execute(&mutation, ()).await.attempts, 1);

        let retrying = mutation.retry(
            RetryPolicy::new(3)
                .with_base_delay(Duration::from_millis(1))
                .with_jitter(0.0),
        );
        assert_eq!(engine.execute(&retrying, ()).await.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_invalid_retry_policy_uses_defaults() {
        let engine = engine();

        let mutation = Mutation::new(|_: ()| async { Err::<(), _>(QueryError::Network("down".into())) })
            .retry(RetryPolicy::new(3).with_jitter(f64::NAN));
        let result = engine.execute(&mutation, ()).await;

        assert!(result.is_error());
        assert_eq!(result.attempts, engine.queries.defaults().mutation_retry_attempts);
    }
}
