//! Infinite queries: an ordered list of pages fetched through the query engine
//!
//! Page `n` is cached under `base_key + param_n`, so every page gets the same
//! de-duplication, retry and staleness handling as any other query, and
//! invalidating `base_key`'s prefix drops all pages at once.

use crate::cache::QueryKey;
use crate::error::{QueryError, Result};
use crate::fetch::RetryPolicy;
use crate::query::{Query, QueryEngine, QueryResult, QueryStatus};
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub type PageFetcher<T, P> = Arc<dyn Fn(P) -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Computes the neighbouring page param from `(edge page, all pages)`;
/// `None` means there is no such page
pub type PageParamFn<T, P> = Arc<dyn Fn(&T, &[T]) -> Option<P> + Send + Sync>;

/// Options of an infinite query
pub struct InfiniteQueryOptions<T, P> {
    pub initial_page_param: P,
    pub get_next_page_param: PageParamFn<T, P>,
    pub get_previous_page_param: Option<PageParamFn<T, P>>,
    pub stale_time: Option<Duration>,
    pub cache_time: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    pub timeout: Option<Duration>,
}

impl<T, P> InfiniteQueryOptions<T, P> {
    pub fn new<F>(initial_page_param: P, get_next_page_param: F) -> Self
    where
        F: Fn(&T, &[T]) -> Option<P> + Send + Sync + 'static,
    {
        Self {
            initial_page_param,
            get_next_page_param: Arc::new(get_next_page_param),
            get_previous_page_param: None,
            stale_time: None,
            cache_time: None,
            retry: None,
            timeout: None,
        }
    }

    pub fn previous_page_param<F>(mut self, get_previous_page_param: F) -> Self
    where
        F: Fn(&T, &[T]) -> Option<P> + Send + Sync + 'static,
    {
        self.get_previous_page_param = Some(Arc::new(get_previous_page_param));
        self
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = Some(cache_time);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One page as seen by a caller
#[derive(Debug, Clone, PartialEq)]
pub struct PageResult<T, P> {
    pub param: P,
    pub data: Option<T>,
    pub status: QueryStatus,
    pub error: Option<QueryError>,
}

/// Snapshot of an infinite query
#[derive(Debug, Clone, PartialEq)]
pub struct InfiniteQueryResult<T, P> {
    /// Pages in display order
    pub pages: Vec<PageResult<T, P>>,
    pub status: QueryStatus,

    /// First page error, if any
    pub error: Option<QueryError>,
    pub has_next_page: bool,
    pub has_previous_page: bool,
}

impl<T, P> InfiniteQueryResult<T, P> {
    /// Data of every loaded page, in order
    pub fn data(&self) -> Vec<&T> {
        self.pages.iter().filter_map(|page| page.data.as_ref()).collect()
    }
}

struct PageSlot<T, P> {
    param: P,
    query: Query<T>,
}

/// Paginated query over a base key
pub struct InfiniteQuery<T, P> {
    engine: QueryEngine,
    base_key: QueryKey,
    fetcher: PageFetcher<T, P>,
    options: InfiniteQueryOptions<T, P>,
    pages: Vec<PageSlot<T, P>>,
}

impl<T, P> InfiniteQuery<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: Clone + Debug + Serialize + Send + Sync + 'static,
{
    pub fn new<F, Fut>(
        engine: QueryEngine,
        base_key: impl Into<QueryKey>,
        fetcher: F,
        options: InfiniteQueryOptions<T, P>,
    ) -> Self
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            engine,
            base_key: base_key.into(),
            fetcher: Arc::new(move |param| fetcher(param).boxed()),
            options,
            pages: Vec::new(),
        }
    }

    pub fn base_key(&self) -> &QueryKey {
        &self.base_key
    }

    /// Load the page after the last one
    ///
    /// The first call loads the initial page. Pages whose cached value
    /// expired or was evicted are reloaded with their own params first. If
    /// the last page errored it is retried with the same param. When there is
    /// no next page nothing is fetched.
    pub async fn fetch_next_page(&mut self) -> InfiniteQueryResult<T, P> {
        if self.pages.is_empty() {
            let slot = self.slot(self.options.initial_page_param.clone());
            self.pages.push(slot);
            self.load(0).await;
            return self.result();
        }

        let last = self.pages.len() - 1;
        let reloaded = self.reload_dropped_pages().await;
        if self.status_of(&self.pages[last]) == QueryStatus::Error {
            if !reloaded.contains(&last) {
                self.load(last).await;
            }
            return self.result();
        }

        match self.next_param() {
            Some(param) => {
                let slot = self.slot(param);
                self.pages.push(slot);
                self.load(last + 1).await;
            }
            None => debug!("No next page for {}", self.base_key),
        }
        self.result()
    }

    /// Load the page before the first one
    pub async fn fetch_previous_page(&mut self) -> InfiniteQueryResult<T, P> {
        if self.pages.is_empty() {
            return self.fetch_next_page().await;
        }

        let reloaded = self.reload_dropped_pages().await;
        if self.status_of(&self.pages[0]) == QueryStatus::Error {
            if !reloaded.contains(&0) {
                self.load(0).await;
            }
            return self.result();
        }

        match self.previous_param() {
            Some(param) => {
                let slot = self.slot(param);
                self.pages.insert(0, slot);
                self.load(0).await;
            }
            None => debug!("No previous page for {}", self.base_key),
        }
        self.result()
    }

    /// Refetch every loaded page in order, keeping their params
    pub async fn refetch(&mut self) -> InfiniteQueryResult<T, P> {
        for page in &self.pages {
            self.engine.refetch(&page.query).await;
        }
        self.result()
    }

    /// Current state without fetching
    pub fn result(&self) -> InfiniteQueryResult<T, P> {
        let pages: Vec<PageResult<T, P>> = self
            .pages
            .iter()
            .map(|slot| {
                let result = self.page_result(slot);
                PageResult {
                    param: slot.param.clone(),
                    data: result.data,
                    status: result.status,
                    error: result.error,
                }
            })
            .collect();

        let status = if pages.is_empty() {
            QueryStatus::Idle
        } else if pages.iter().any(|p| p.status == QueryStatus::Error) {
            QueryStatus::Error
        } else if pages.iter().any(|p| p.status == QueryStatus::Loading) {
            QueryStatus::Loading
        } else if pages.iter().all(|p| p.status == QueryStatus::Success) {
            QueryStatus::Success
        } else {
            QueryStatus::Idle
        };

        let error = pages.iter().find_map(|p| p.error.clone());

        // An errored or dropped edge page is reloaded before paging on
        let has_next_page = match pages.last() {
            None => true,
            Some(last) if matches!(last.status, QueryStatus::Error | QueryStatus::Idle) => true,
            Some(_) => self.next_param().is_some(),
        };
        let has_previous_page = match pages.first() {
            None => false,
            Some(first) if first.status == QueryStatus::Idle => {
                self.options.get_previous_page_param.is_some()
            }
            Some(_) => self.previous_param().is_some(),
        };

        InfiniteQueryResult {
            pages,
            status,
            error,
            has_next_page,
            has_previous_page,
        }
    }

    fn slot(&self, param: P) -> PageSlot<T, P> {
        let fetcher = self.fetcher.clone();
        let page_param = param.clone();

        let mut query = match self.base_key.child(&param) {
            Ok(key) => Query::new(key, move || fetcher(page_param.clone())),
            Err(error) => {
                // Unserializable param: park the page under the base key and
                // fail it without calling the fetcher
                Query::new(self.base_key.clone(), move || {
                    let error = error.clone();
                    async move { Err(error) }
                })
            }
        };

        query.options.stale_time = self.options.stale_time;
        query.options.cache_time = self.options.cache_time;
        query.options.retry = self.options.retry.clone();
        query.options.timeout = self.options.timeout;

        PageSlot { param, query }
    }

    /// Reload every page with neither data nor a running fetch
    async fn reload_dropped_pages(&self) -> Vec<usize> {
        let dropped: Vec<usize> = self
            .pages
            .iter()
            .enumerate()
            .filter(|(_, slot)| self.status_of(slot) == QueryStatus::Idle)
            .map(|(index, _)| index)
            .collect();

        for &index in &dropped {
            debug!("Reloading dropped page {} of {}", index, self.base_key);
            self.load(index).await;
        }
        dropped
    }

    async fn load(&self, index: usize) {
        if let Some(slot) = self.pages.get(index) {
            debug!("Fetching page {} ({:?}) of {}", index, slot.param, self.base_key);
            self.engine.refetch(&slot.query).await;
        }
    }

    fn page_result(&self, slot: &PageSlot<T, P>) -> QueryResult<T> {
        let stale_time = slot
            .query
            .options
            .stale_time
            .unwrap_or(self.engine.defaults().stale_time);
        self.engine.result_for(&slot.query.cache_key(), stale_time)
    }

    fn status_of(&self, slot: &PageSlot<T, P>) -> QueryStatus {
        self.page_result(slot).status
    }

    fn loaded_data(&self) -> Vec<T> {
        self.pages
            .iter()
            .filter_map(|slot| self.page_result(slot).data)
            .collect()
    }

    fn next_param(&self) -> Option<P> {
        let last = self.pages.last()?;
        let last_data = self.page_result(last).data?;
        (self.options.get_next_page_param)(&last_data, &self.loaded_data())
    }

    fn previous_param(&self) -> Option<P> {
        let get_previous = self.options.get_previous_page_param.as_ref()?;
        let first = self.pages.first()?;
        let first_data = self.page_result(first).data?;
        get_previous(&first_data, &self.loaded_data())
    }
}
