//! Request de-duplication and generation-checked write-back

use crate::cache::{CacheKey, CacheStore, InvalidationPattern};
use crate::error::{QueryError, Result};
use crate::fetch::retry::{execute_with_retry, RetryPolicy};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Type-erased fetch function
pub type Fetcher<V> = Arc<dyn Fn() -> BoxFuture<'static, Result<V>> + Send + Sync>;

/// Called with the request id and final result before any handle resolves
pub type SettleHook<V> = Arc<dyn Fn(u64, &Result<V>) + Send + Sync>;

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V>>>;

/// Wrap an async closure as a [`Fetcher`]
pub fn fetcher<V, F, Fut>(f: F) -> Fetcher<V>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Per-dispatch settings, used only when a new request is started
#[derive(Clone)]
pub struct DispatchOptions<V> {
    pub retry: RetryPolicy,

    /// TTL for the written-back value
    pub ttl: Duration,

    /// Per-attempt timeout
    pub timeout: Option<Duration>,

    pub on_settle: Option<SettleHook<V>>,
}

impl<V> DispatchOptions<V> {
    pub fn new(retry: RetryPolicy, ttl: Duration) -> Self {
        Self {
            retry,
            ttl,
            timeout: None,
            on_settle: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_settle_hook(mut self, hook: SettleHook<V>) -> Self {
        self.on_settle = Some(hook);
        self
    }
}

struct InFlightRequest<V> {
    id: u64,
    shared: SharedFetch<V>,
    subscribers: Arc<AtomicUsize>,
    superseded: Arc<AtomicBool>,
    generation: u64,
    dispatched_at: DateTime<Utc>,
}

type InFlightMap<V> = Arc<Mutex<HashMap<CacheKey, InFlightRequest<V>>>>;

/// Ensures at most one fetch per key is running
///
/// Every caller of [`dispatch`](Self::dispatch) for a key that is already
/// being fetched joins the running request and receives the same result.
/// Each request runs on its own task: dropping all handles never aborts it,
/// but no further retries are attempted once nobody is waiting.
///
/// A successful result is written with
/// [`CacheStore::set_if_generation`] against the generation the key had at
/// dispatch time, so a slow fetch never overwrites a newer write.
pub struct FetchCoordinator<V> {
    cache: Arc<CacheStore<V>>,
    in_flight: InFlightMap<V>,
    next_id: AtomicU64,
}

impl<V> FetchCoordinator<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(cache: Arc<CacheStore<V>>) -> Self {
        Self {
            cache,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// The store results are written to
    pub fn cache(&self) -> &Arc<CacheStore<V>> {
        &self.cache
    }

    /// Start fetching `key`, or join the request already running for it
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, key: &str, fetcher: Fetcher<V>, options: DispatchOptions<V>) -> FetchHandle<V> {
        let mut in_flight = self.in_flight.lock();

        if let Some(request) = in_flight.get(key) {
            request.subscribers.fetch_add(1, Ordering::SeqCst);
            debug!(
                "Joining in-flight fetch for {} (request {}, dispatched at {})",
                key, request.id, request.dispatched_at
            );
            return FetchHandle {
                key: key.to_string(),
                request_id: request.id,
                shared: request.shared.clone(),
                subscribers: Some(request.subscribers.clone()),
                joined: true,
            };
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let generation = self.cache.generation(key);
        let subscribers = Arc::new(AtomicUsize::new(1));
        let superseded = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel();

        let task = FetchTask {
            key: key.to_string(),
            id,
            generation,
            cache: self.cache.clone(),
            in_flight: self.in_flight.clone(),
            subscribers: subscribers.clone(),
            superseded: superseded.clone(),
        };
        tokio::spawn(task.run(fetcher, options, tx));

        let shared = rx
            .map(|received| {
                received.unwrap_or_else(|_| {
                    Err(QueryError::Cancelled("fetch task ended without a result".to_string()))
                })
            })
            .boxed()
            .shared();

        in_flight.insert(
            key.to_string(),
            InFlightRequest {
                id,
                shared: shared.clone(),
                subscribers: subscribers.clone(),
                superseded,
                generation,
                dispatched_at: Utc::now(),
            },
        );

        debug!("Dispatched fetch for {} (request {}, generation {})", key, id, generation);

        FetchHandle {
            key: key.to_string(),
            request_id: id,
            shared,
            subscribers: Some(subscribers),
            joined: false,
        }
    }

    /// Detach in-flight requests whose keys match `pattern`
    ///
    /// Their results are discarded on arrival and the next dispatch for the
    /// key starts a fresh request. Callers already waiting still receive the
    /// superseded result.
    pub fn supersede(&self, pattern: &InvalidationPattern) -> usize {
        let mut in_flight = self.in_flight.lock();
        let mut superseded = 0;

        in_flight.retain(|key, request| {
            if pattern.matches(key) {
                request.superseded.store(true, Ordering::SeqCst);
                debug!(
                    "Superseding fetch for {} (request {}, generation {})",
                    key, request.id, request.generation
                );
                superseded += 1;
                false
            } else {
                true
            }
        });

        if superseded > 0 {
            info!("Superseded {} in-flight fetches matching {}", superseded, pattern);
        }
        superseded
    }

    /// Number of requests currently running
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Whether a request is running for `key`
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    /// Handles currently attached to the request for `key`
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.in_flight
            .lock()
            .get(key)
            .map(|request| request.subscribers.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

struct FetchTask<V> {
    key: CacheKey,
    id: u64,
    generation: u64,
    cache: Arc<CacheStore<V>>,
    in_flight: InFlightMap<V>,
    subscribers: Arc<AtomicUsize>,
    superseded: Arc<AtomicBool>,
}

impl<V> FetchTask<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn run(self, fetcher: Fetcher<V>, options: DispatchOptions<V>, tx: oneshot::Sender<Result<V>>) {
        let subscribers = self.subscribers.clone();
        let outcome = execute_with_retry(
            || fetcher(),
            &options.retry,
            options.timeout,
            &self.key,
            || subscribers.load(Ordering::SeqCst) > 0,
        )
        .await;

        {
            // Commit and detach under the map lock so `supersede` either sees
            // this request or runs after the value is in the cache.
            let mut in_flight = self.in_flight.lock();

            if let Ok(value) = &outcome.result {
                if self.superseded.load(Ordering::SeqCst) {
                    debug!("Discarding result for {}: superseded by invalidation", self.key);
                } else {
                    self.cache
                        .set_if_generation(self.key.clone(), value.clone(), options.ttl, self.generation);
                }
            }

            if in_flight
                .get(&self.key)
                .is_some_and(|request| request.id == self.id)
            {
                in_flight.remove(&self.key);
            }
        }

        if let Some(hook) = &options.on_settle {
            hook(self.id, &outcome.result);
        }

        // Nobody listening is fine
        let _ = tx.send(outcome.result);
    }
}

impl<V> Drop for FetchTask<V> {
    fn drop(&mut self) {
        // Only does work if `run` never reached its commit step
        let mut in_flight = self.in_flight.lock();
        if in_flight
            .get(&self.key)
            .is_some_and(|request| request.id == self.id)
        {
            in_flight.remove(&self.key);
        }
    }
}

/// Awaitable share of an in-flight request
///
/// Resolves to the request's final result. Dropping the handle detaches from
/// the request; the fetch itself keeps running.
pub struct FetchHandle<V> {
    key: CacheKey,
    request_id: u64,
    shared: SharedFetch<V>,
    subscribers: Option<Arc<AtomicUsize>>,
    joined: bool,
}

impl<V> FetchHandle<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Id of the request this handle is attached to
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Whether this handle joined a request started by another caller
    pub fn is_joined(&self) -> bool {
        self.joined
    }

    /// Stop counting as a subscriber while still receiving the result
    pub fn detach(mut self) -> impl Future<Output = Result<V>> {
        if let Some(subscribers) = self.subscribers.take() {
            subscribers.fetch_sub(1, Ordering::SeqCst);
        }
        self.shared.clone()
    }
}

impl<V> Future for FetchHandle<V>
where
    V: Clone + Send + Sync + 'static,
{
    type Output = Result<V>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.shared.poll_unpin(cx)
    }
}

impl<V> Drop for FetchHandle<V> {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.take() {
            subscribers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
