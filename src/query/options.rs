//! Query descriptors and their options

use crate::cache::{CacheKey, QueryKey};
use crate::config::QueryDefaults;
use crate::error::{QueryError, Result};
use crate::fetch::RetryPolicy;
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Typed fetch function of a query
pub type QueryFetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

pub type SuccessCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&QueryError) + Send + Sync>;
pub type SettledCallback<T> = Arc<dyn Fn(Option<&T>, Option<&QueryError>) + Send + Sync>;

/// Per-query options; unset values fall back to the client's [`QueryDefaults`]
///
/// Callbacks fire once per network fetch, for the query that started it.
pub struct QueryOptions<T> {
    pub stale_time: Option<Duration>,
    pub cache_time: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    pub enabled: bool,

    /// Per-attempt timeout
    pub timeout: Option<Duration>,

    pub on_success: Option<SuccessCallback<T>>,
    pub on_error: Option<ErrorCallback>,
    pub on_settled: Option<SettledCallback<T>>,
}

impl<T> Clone for QueryOptions<T> {
    fn clone(&self) -> Self {
        Self {
            stale_time: self.stale_time,
            cache_time: self.cache_time,
            retry: self.retry.clone(),
            enabled: self.enabled,
            timeout: self.timeout,
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
        }
    }
}

impl<T> Default for QueryOptions<T> {
    fn default() -> Self {
        Self {
            stale_time: None,
            cache_time: None,
            retry: None,
            enabled: true,
            timeout: None,
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }
}

/// Options with defaults applied
#[derive(Debug, Clone)]
pub(crate) struct ResolvedOptions {
    pub stale_time: Duration,
    pub cache_time: Duration,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
}

impl<T> QueryOptions<T> {
    pub(crate) fn resolve(&self, defaults: &QueryDefaults, key: &str) -> ResolvedOptions {
        let stale_time = self.stale_time.unwrap_or(defaults.stale_time);
        let mut cache_time = self.cache_time.unwrap_or(defaults.cache_time);

        if cache_time < stale_time {
            warn!(
                "cache_time {:?} is shorter than stale_time {:?} for {}, using stale_time",
                cache_time, stale_time, key
            );
            cache_time = stale_time;
        }

        ResolvedOptions {
            stale_time,
            cache_time,
            retry: match &self.retry {
                Some(retry) => retry.clone().or_valid(|| defaults.query_retry(), key),
                None => defaults.query_retry(),
            },
            timeout: self.timeout.or(defaults.request_timeout),
        }
    }
}

/// A key plus the function that fetches its value
pub struct Query<T> {
    pub key: QueryKey,
    pub(crate) fetcher: QueryFetcher<T>,
    pub options: QueryOptions<T>,
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            fetcher: self.fetcher.clone(),
            options: self.options.clone(),
        }
    }
}

impl<T> Query<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a query
    ///
    /// ```
    /// use ouroboros_query::{query_key, Query};
    /// use std::time::Duration;
    ///
    /// let query = Query::new(query_key!("posts", 42), || async { Ok("hello".to_string()) })
    ///     .stale_time(Duration::from_secs(30));
    /// assert_eq!(query.cache_key(), "posts:42");
    /// ```
    pub fn new<F, Fut>(key: impl Into<QueryKey>, fetcher: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            key: key.into(),
            fetcher: Arc::new(move || fetcher().boxed()),
            options: QueryOptions::default(),
        }
    }

    /// Canonical cache key
    pub fn cache_key(&self) -> CacheKey {
        self.key.encode()
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.options.stale_time = Some(stale_time);
        self
    }

    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.options.cache_time = Some(cache_time);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.options.retry = Some(retry);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.options.enabled = enabled;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.options.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&QueryError) + Send + Sync + 'static,
    {
        self.options.on_error = Some(Arc::new(callback));
        self
    }

    pub fn on_settled<F>(mut self, callback: F) -> Self
    where
        F: Fn(Option<&T>, Option<&QueryError>) + Send + Sync + 'static,
    {
        self.options.on_settled = Some(Arc::new(callback));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;

    fn query() -> Query<u32> {
        Query::new(query_key!("counter"), || async { Ok(1) })
    }

    #[test]
    fn test_defaults_fill_unset_options() {
        let defaults = QueryDefaults::default();
        let resolved = query().options.resolve(&defaults, "counter");

        assert_eq!(resolved.stale_time, defaults.stale_time);
        assert_eq!(resolved.cache_time, defaults.cache_time);
        assert_eq!(resolved.retry.max_attempts, defaults.retry_attempts);
        assert_eq!(resolved.timeout, None);
    }

    #[test]
    fn test_cache_time_is_raised_to_stale_time() {
        let resolved = query()
            .stale_time(Duration::from_secs(60))
            .cache_time(Duration::from_secs(5))
            .options
            .resolve(&QueryDefaults::default(), "counter");

        assert_eq!(resolved.cache_time, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_retry_policy_uses_defaults() {
        let defaults = QueryDefaults::default();
        let resolved = query()
            .retry(RetryPolicy::new(4).with_jitter(f64::NAN))
            .options
            .resolve(&defaults, "counter");

        assert_eq!(resolved.retry.max_attempts, defaults.retry_attempts);
        assert!(resolved.retry.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let q = query()
            .enabled(false)
            .retry(RetryPolicy::none())
            .timeout(Duration::from_millis(250))
            .on_success(|_| {});

        assert!(!q.options.enabled);
        assert_eq!(q.options.retry.as_ref().map(|r| r.max_attempts), Some(1));
        assert_eq!(q.options.timeout, Some(Duration::from_millis(250)));
        assert!(q.options.on_success.is_some());
        assert_eq!(q.cache_key(), "counter");
    }
}
