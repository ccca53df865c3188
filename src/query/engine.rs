//! The query engine: cache-first reads with stale-while-revalidate
//!
//! Values live only in the shared [`CacheStore`]. The engine keeps per-key
//! bookkeeping (last error, running fetches, listeners, background tasks)
//! and derives every [`QueryResult`] from that bookkeeping plus the cache.
//!
//! Lock order: the registry lock may be held while the coordinator takes its
//! in-flight lock, never the other way around. Listeners and callbacks run
//! with no lock held.

use crate::cache::{CacheKey, CacheStore, InvalidationPattern, Payload, QueryKey};
use crate::config::QueryDefaults;
use crate::error::{QueryError, Result};
use crate::fetch::{DispatchOptions, FetchCoordinator, FetchHandle, Fetcher, SettleHook};
use crate::query::options::{Query, ResolvedOptions};
use crate::query::result::{QueryResult, QueryStatus};
use crate::state::{ActivityGuard, GlobalQueryState};
use futures::future::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

type Listener = Arc<dyn Fn(&QueryEngine) + Send + Sync>;
type ErasedCallbacks = Arc<dyn Fn(&Result<Payload>) + Send + Sync>;

/// A query with its value type erased, kept for refetching after invalidation
#[derive(Clone)]
pub(crate) struct ErasedQuery {
    fetcher: Fetcher<Payload>,
    options: ResolvedOptions,
    callbacks: Option<ErasedCallbacks>,
}

impl ErasedQuery {
    fn new<T>(query: &Query<T>, options: ResolvedOptions) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        let typed = query.fetcher.clone();
        let fetcher: Fetcher<Payload> =
            Arc::new(move || typed().map(|result| result.map(Payload::new)).boxed());

        let on_success = query.options.on_success.clone();
        let on_error = query.options.on_error.clone();
        let on_settled = query.options.on_settled.clone();

        let callbacks: Option<ErasedCallbacks> =
            if on_success.is_none() && on_error.is_none() && on_settled.is_none() {
                None
            } else {
                Some(Arc::new(move |result: &Result<Payload>| match result {
                    Ok(payload) => {
                        let data = payload.downcast::<T>();
                        if let (Some(callback), Some(data)) = (&on_success, &data) {
                            callback(data);
                        }
                        if let Some(callback) = &on_settled {
                            callback(data.as_ref(), None);
                        }
                    }
                    Err(error) => {
                        if let Some(callback) = &on_error {
                            callback(error);
                        }
                        if let Some(callback) = &on_settled {
                            callback(None, Some(error));
                        }
                    }
                }))
            };

        Self {
            fetcher,
            options,
            callbacks,
        }
    }
}

#[derive(Default)]
struct KeyState {
    /// Terminal error of the last settled fetch
    error: Option<QueryError>,

    /// One guard per running request, keyed by request id
    activities: HashMap<u64, ActivityGuard>,

    listeners: Vec<(u64, Listener)>,

    /// Most recent query seen for this key
    query: Option<ErasedQuery>,

    /// Background refetches owned by subscribers
    tasks: Vec<JoinHandle<()>>,
}

/// Executes queries against the shared cache
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct QueryEngine {
    cache: Arc<CacheStore<Payload>>,
    coordinator: Arc<FetchCoordinator<Payload>>,
    global: Arc<GlobalQueryState>,
    defaults: Arc<QueryDefaults>,
    registry: Arc<Mutex<HashMap<CacheKey, KeyState>>>,
    next_listener_id: Arc<AtomicU64>,
}

impl QueryEngine {
    pub fn new(
        cache: Arc<CacheStore<Payload>>,
        global: Arc<GlobalQueryState>,
        defaults: QueryDefaults,
    ) -> Self {
        Self {
            coordinator: Arc::new(FetchCoordinator::new(cache.clone())),
            cache,
            global,
            defaults: Arc::new(defaults),
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_listener_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn cache(&self) -> &Arc<CacheStore<Payload>> {
        &self.cache
    }

    pub fn coordinator(&self) -> &Arc<FetchCoordinator<Payload>> {
        &self.coordinator
    }

    pub fn defaults(&self) -> &QueryDefaults {
        &self.defaults
    }

    pub(crate) fn global(&self) -> &Arc<GlobalQueryState> {
        &self.global
    }

    /// Run a query
    ///
    /// - fresh hit: returned as-is
    /// - stale hit: returned immediately, refetched in the background
    /// - miss: fetched (or joined) and awaited
    ///
    /// Failures come back as an `Error` result, never as a panic or `Err`.
    pub async fn fetch<T>(&self, query: &Query<T>) -> QueryResult<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let key = query.cache_key();
        let options = query.options.resolve(&self.defaults, &key);

        if !query.options.enabled {
            return self.disabled_result(&key, options.stale_time);
        }

        let erased = self.remember(&key, query, options.clone());

        match self.cache.get_entry(&key) {
            Some(entry) if !entry.is_stale(options.stale_time) => {}
            Some(_) => {
                debug!("Serving stale value for {} while revalidating", key);
                let handle = self.start_fetch(&key, &erased);
                self.track(&key, handle);
            }
            None => {
                let outcome = self.start_fetch(&key, &erased).await;
                return self.settled_result(&key, options.stale_time, outcome);
            }
        }

        self.result_for(&key, options.stale_time)
    }

    /// Synchronous read; starts a background fetch on a miss or stale hit
    ///
    /// Must be called from within a tokio runtime.
    pub fn read<T>(&self, query: &Query<T>) -> QueryResult<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let key = query.cache_key();
        let options = query.options.resolve(&self.defaults, &key);

        if !query.options.enabled {
            return self.disabled_result(&key, options.stale_time);
        }

        let erased = self.remember(&key, query, options.clone());

        let fresh = self
            .cache
            .get_entry(&key)
            .is_some_and(|entry| !entry.is_stale(options.stale_time));
        if !fresh {
            let handle = self.start_fetch(&key, &erased);
            self.track(&key, handle);
        }

        self.result_for(&key, options.stale_time)
    }

    /// Fetch regardless of freshness and wait for the result
    pub async fn refetch<T>(&self, query: &Query<T>) -> QueryResult<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let key = query.cache_key();
        let options = query.options.resolve(&self.defaults, &key);

        if !query.options.enabled {
            return self.disabled_result(&key, options.stale_time);
        }

        let erased = self.remember(&key, query, options.clone());
        let outcome = self.start_fetch(&key, &erased).await;

        self.settled_result(&key, options.stale_time, outcome)
    }

    /// Warm the cache without producing a result
    pub async fn prefetch<T>(&self, query: &Query<T>)
    where
        T: Clone + Send + Sync + 'static,
    {
        let key = query.cache_key();
        let options = query.options.resolve(&self.defaults, &key);

        let fresh = self
            .cache
            .peek(&key)
            .is_some_and(|entry| !entry.is_stale(options.stale_time));
        if fresh || !query.options.enabled {
            return;
        }

        let erased = self.remember(&key, query, options);
        let _ = self.start_fetch(&key, &erased).await;
    }

    /// Observe a query
    ///
    /// `listener` is called with a fresh [`QueryResult`] after every change
    /// to the key. The subscription also starts a fetch when the cached value
    /// is missing or stale. Dropping the last subscription of a key aborts its
    /// background refetches and their retries.
    pub fn subscribe<T, L>(&self, query: &Query<T>, listener: L) -> QuerySubscription
    where
        T: Clone + Send + Sync + 'static,
        L: Fn(QueryResult<T>) + Send + Sync + 'static,
    {
        let key = query.cache_key();
        let stale_time = query.options.resolve(&self.defaults, &key).stale_time;
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);

        let listener_key = key.clone();
        let erased: Listener =
            Arc::new(move |engine: &QueryEngine| listener(engine.result_for(&listener_key, stale_time)));

        self.registry
            .lock()
            .entry(key.clone())
            .or_default()
            .listeners
            .push((id, erased));
        debug!("Subscribed listener {} to {}", id, key);

        let _ = self.read(query);

        QuerySubscription {
            engine: self.clone(),
            key,
            id,
        }
    }

    /// Number of keys the engine holds bookkeeping for
    ///
    /// A key is tracked while it has subscribers or running requests, or
    /// when its last fetch failed.
    pub fn tracked_keys(&self) -> usize {
        self.registry.lock().len()
    }

    /// Number of live subscriptions for `key`
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.registry
            .lock()
            .get(key)
            .map(|state| state.listeners.len())
            .unwrap_or(0)
    }

    /// Typed read of a cached value without touching statistics
    pub fn get_query_data<T>(&self, key: impl Into<QueryKey>) -> Result<Option<T>>
    where
        T: Clone + 'static,
    {
        let key = key.into().encode();
        match self.cache.peek(&key) {
            None => Ok(None),
            Some(entry) => entry
                .value
                .downcast::<T>()
                .map(Some)
                .ok_or_else(|| type_mismatch::<T>(&key)),
        }
    }

    /// Write a value directly, as if it had been fetched
    pub fn set_query_data<T>(&self, key: impl Into<QueryKey>, value: T) -> u64
    where
        T: Send + Sync + 'static,
    {
        let key = key.into().encode();
        let generation = self
            .cache
            .set(key.clone(), Payload::new(value), self.defaults.cache_time);

        self.clear_error(&key);
        self.notify(&key);
        generation
    }

    /// Invalidate every key matching `pattern`
    ///
    /// Matching entries are removed, running fetches for them are superseded
    /// and keys that still have subscribers are refetched.
    pub fn invalidate(&self, pattern: &str) -> Result<usize> {
        let pattern = InvalidationPattern::parse(pattern)?;
        Ok(self.invalidate_pattern(&pattern))
    }

    pub fn invalidate_pattern(&self, pattern: &InvalidationPattern) -> usize {
        // Supersede first: a fetch that commits before this point is removed
        // below, one that settles after it sees the flag.
        self.coordinator.supersede(pattern);
        let removed = self.cache.invalidate_pattern(pattern);

        let observed = {
            let mut registry = self.registry.lock();
            let matching: Vec<CacheKey> = registry
                .keys()
                .filter(|key| pattern.matches(key))
                .cloned()
                .collect();

            let mut observed: Vec<(CacheKey, Option<ErasedQuery>)> = Vec::new();
            for key in matching {
                let Some(state) = registry.get_mut(&key) else {
                    continue;
                };
                if state.listeners.is_empty() {
                    state.error = None;
                    prune(&mut registry, &key);
                } else {
                    observed.push((key, state.query.clone()));
                }
            }
            observed
        };

        for (key, query) in observed {
            match query {
                Some(query) => {
                    debug!("Refetching observed key {} after invalidation", key);
                    let handle = self.start_fetch(&key, &query);
                    self.track(&key, handle);
                }
                None => self.notify(&key),
            }
        }

        removed
    }

    /// Current result for `key` without starting anything
    pub(crate) fn result_for<T>(&self, key: &str, stale_time: Duration) -> QueryResult<T>
    where
        T: Clone + 'static,
    {
        let (error, is_fetching) = self
            .registry
            .lock()
            .get(key)
            .map(|state| (state.error.clone(), !state.activities.is_empty()))
            .unwrap_or((None, false));

        let mut result = QueryResult::idle();
        result.is_fetching = is_fetching;

        if let Some(entry) = self.cache.peek(key) {
            match entry.value.downcast::<T>() {
                Some(data) => {
                    result.is_stale = entry.is_stale(stale_time);
                    result.updated_at = Some(entry.metadata.inserted_at);
                    result.data = Some(data);
                }
                None => {
                    let mismatch = type_mismatch::<T>(key);
                    error!("{}", mismatch);
                    result.status = QueryStatus::Error;
                    result.error = Some(mismatch);
                    return result;
                }
            }
        }

        result.status = match (&result.data, &error, is_fetching) {
            (_, Some(_), false) => QueryStatus::Error,
            (Some(_), _, _) => QueryStatus::Success,
            (None, _, true) => QueryStatus::Loading,
            (None, _, false) => QueryStatus::Idle,
        };
        result.error = error;
        result
    }

    /// Result of a fetch the caller awaited
    ///
    /// The cache and registry win when they hold anything. Otherwise the
    /// value never reached the cache (superseded, evicted, zero cache time)
    /// and the awaited outcome is returned as-is.
    fn settled_result<T>(&self, key: &str, stale_time: Duration, outcome: Result<Payload>) -> QueryResult<T>
    where
        T: Clone + 'static,
    {
        let mut result = self.result_for::<T>(key, stale_time);
        if result.data.is_some() || result.error.is_some() {
            return result;
        }

        match outcome {
            Ok(payload) => match payload.downcast::<T>() {
                Some(data) => {
                    result.status = QueryStatus::Success;
                    result.is_stale = true;
                    result.data = Some(data);
                }
                None => {
                    let mismatch = type_mismatch::<T>(key);
                    error!("{}", mismatch);
                    result.status = QueryStatus::Error;
                    result.error = Some(mismatch);
                }
            },
            Err(error) => {
                result.status = QueryStatus::Error;
                result.error = Some(error);
            }
        }
        result
    }

    /// Call every listener of `key`
    pub(crate) fn notify(&self, key: &str) {
        let listeners: Vec<Listener> = self
            .registry
            .lock()
            .get(key)
            .map(|state| state.listeners.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();

        for listener in listeners {
            listener(self);
        }
    }

    fn disabled_result<T>(&self, key: &str, stale_time: Duration) -> QueryResult<T>
    where
        T: Clone + 'static,
    {
        debug!("Query {} is disabled", key);
        QueryResult {
            status: QueryStatus::Idle,
            is_fetching: false,
            ..self.result_for(key, stale_time)
        }
    }

    fn remember<T>(&self, key: &CacheKey, query: &Query<T>, options: ResolvedOptions) -> ErasedQuery
    where
        T: Clone + Send + Sync + 'static,
    {
        let erased = ErasedQuery::new(query, options);
        // Only observed keys are refetched after invalidation
        if let Some(state) = self.registry.lock().get_mut(key) {
            if !state.listeners.is_empty() {
                state.query = Some(erased.clone());
            }
        }
        erased
    }

    fn clear_error(&self, key: &str) {
        let mut registry = self.registry.lock();
        if let Some(state) = registry.get_mut(key) {
            state.error = None;
            prune(&mut registry, key);
        }
    }

    /// Dispatch a fetch and record it as running
    fn start_fetch(&self, key: &CacheKey, query: &ErasedQuery) -> FetchHandle<Payload> {
        let options = DispatchOptions::new(query.options.retry.clone(), query.options.cache_time)
            .with_timeout(query.options.timeout)
            .with_settle_hook(self.settle_hook(key, query));

        let handle = {
            let mut registry = self.registry.lock();
            let handle = self.coordinator.dispatch(key, query.fetcher.clone(), options);
            if !handle.is_joined() {
                registry
                    .entry(key.clone())
                    .or_default()
                    .activities
                    .insert(handle.request_id(), self.global.begin_quiet());
            }
            handle
        };

        if !handle.is_joined() {
            self.global.notify();
            self.notify(key);
        }
        handle
    }

    fn settle_hook(&self, key: &CacheKey, query: &ErasedQuery) -> SettleHook<Payload> {
        let engine = self.clone();
        let key = key.clone();
        let callbacks = query.callbacks.clone();

        Arc::new(move |request_id, result| {
            engine.settle(&key, request_id, result, callbacks.as_ref());
        })
    }

    fn settle(
        &self,
        key: &str,
        request_id: u64,
        result: &Result<Payload>,
        callbacks: Option<&ErasedCallbacks>,
    ) {
        let guard = {
            let mut registry = self.registry.lock();
            let state = registry.entry(key.to_string()).or_default();
            state.error = result.as_ref().err().cloned();
            let guard = state.activities.remove(&request_id);
            prune(&mut registry, key);
            guard
        };

        if let Err(error) = result {
            warn!("Query {} failed: {}", key, error);
            self.global.record_error(error.clone());
        } else {
            debug!("Query {} settled", key);
        }

        if let Some(callbacks) = callbacks {
            callbacks(result);
        }

        drop(guard);
        self.notify(key);
    }

    /// Keep a handle alive in the background until it settles or the last
    /// subscriber of `key` leaves
    fn track(&self, key: &CacheKey, handle: FetchHandle<Payload>) {
        let task = tokio::spawn(async move {
            let _ = handle.await;
        });

        // Without subscribers the task runs detached
        if let Some(state) = self.registry.lock().get_mut(key) {
            if !state.listeners.is_empty() {
                state.tasks.retain(|task| !task.is_finished());
                state.tasks.push(task);
            }
        }
    }

    fn unsubscribe(&self, key: &str, id: u64) {
        let aborted = {
            let mut registry = self.registry.lock();
            let Some(state) = registry.get_mut(key) else {
                return;
            };
            state.listeners.retain(|(lid, _)| *lid != id);
            if state.listeners.is_empty() {
                let tasks = std::mem::take(&mut state.tasks);
                prune(&mut registry, key);
                tasks
            } else {
                Vec::new()
            }
        };

        debug!("Unsubscribed listener {} from {}", id, key);
        for task in aborted {
            task.abort();
        }
    }
}

/// Forget a key nobody observes or fetches
///
/// A failed key keeps its error, and nothing else, until a later fetch
/// succeeds or the key is invalidated.
fn prune(registry: &mut HashMap<CacheKey, KeyState>, key: &str) {
    let Some(state) = registry.get_mut(key) else {
        return;
    };
    if !state.listeners.is_empty() || !state.activities.is_empty() {
        return;
    }

    if state.error.is_none() {
        registry.remove(key);
    } else {
        state.query = None;
        state.tasks.clear();
    }
}

fn type_mismatch<T>(key: &str) -> QueryError {
    QueryError::CacheConsistency(format!(
        "cached value for {} is not a {}",
        key,
        std::any::type_name::<T>()
    ))
}

/// Keeps a listener registered; dropping it unsubscribes
#[must_use = "dropping a QuerySubscription unsubscribes immediately"]
pub struct QuerySubscription {
    engine: QueryEngine,
    key: CacheKey,
    id: u64,
}

impl QuerySubscription {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for QuerySubscription {
    fn drop(&mut self) {
        self.engine.unsubscribe(&self.key, self.id);
    }
}
