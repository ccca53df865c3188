//! The query client: the single entry point feature code talks to

use crate::cache::{start_auto_cleanup, CacheStats, CacheStore, Payload, QueryKey};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::mutation::{Mutation, MutationEngine, MutationResult};
use crate::pagination::{InfiniteQuery, InfiniteQueryOptions};
use crate::query::{Query, QueryEngine, QueryResult};
use crate::state::GlobalQueryState;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Owns the cache and wires the engines to it
///
/// ```no_run
/// use ouroboros_query::{query_key, EngineConfig, GlobalQueryState, Query, QueryClient};
///
/// # async fn example() -> anyhow::Result<()> {
/// let client = QueryClient::new(EngineConfig::default(), GlobalQueryState::new())?;
/// client.start();
///
/// let posts = Query::new(query_key!("posts"), || async { Ok(vec!["hello".to_string()]) });
/// let result = client.query(&posts).await;
/// println!("{:?}", result.data);
///
/// client.invalidate("posts:*")?;
/// client.shutdown();
/// # Ok(())
/// # }
/// ```
pub struct QueryClient {
    config: EngineConfig,
    cache: Arc<CacheStore<Payload>>,
    global: Arc<GlobalQueryState>,
    queries: QueryEngine,
    mutations: MutationEngine,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl QueryClient {
    /// Validate `config` and build a client around `global`
    pub fn new(config: EngineConfig, global: Arc<GlobalQueryState>) -> Result<Self> {
        config.validate()?;

        let cache = Arc::new(CacheStore::new(config.cache.clone()));
        let queries = QueryEngine::new(cache.clone(), global.clone(), config.queries.clone());
        let mutations = MutationEngine::new(queries.clone());

        info!("Query client created (max_entries: {})", config.cache.max_entries);

        Ok(Self {
            config,
            cache,
            global,
            queries,
            mutations,
            sweeper: Mutex::new(None),
        })
    }

    /// Build a client from `OUROBOROS_QUERY_*` environment variables
    pub fn from_env(global: Arc<GlobalQueryState>) -> Result<Self> {
        Self::new(EngineConfig::from_env()?, global)
    }

    /// Start the background expiry sweep, if enabled
    ///
    /// Must be called from within a tokio runtime. Calling it twice is a no-op.
    pub fn start(&self) {
        if !self.config.cache.enable_auto_cleanup {
            return;
        }

        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            *sweeper = Some(start_auto_cleanup(&self.cache));
        }
    }

    /// Stop the sweep and drop global listeners; cached data stays readable
    pub fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        self.global.shutdown();
        info!("Query client shut down: {}", self.cache.stats());
    }

    pub async fn query<T>(&self, query: &Query<T>) -> QueryResult<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.queries.fetch(query).await
    }

    pub async fn mutate<V, T>(&self, mutation: &Mutation<V, T>, variables: V) -> MutationResult<T>
    where
        V: Clone + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
    {
        self.mutations.execute(mutation, variables).await
    }

    pub fn infinite_query<T, P, F, Fut>(
        &self,
        base_key: impl Into<QueryKey>,
        fetcher: F,
        options: InfiniteQueryOptions<T, P>,
    ) -> InfiniteQuery<T, P>
    where
        T: Clone + Send + Sync + 'static,
        P: Clone + Debug + Serialize + Send + Sync + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        InfiniteQuery::new(self.queries.clone(), base_key, fetcher, options)
    }

    /// Invalidate matching entries and refetch the ones still observed
    pub fn invalidate(&self, pattern: &str) -> Result<usize> {
        self.queries.invalidate(pattern)
    }

    pub fn get_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn global_state(&self) -> &Arc<GlobalQueryState> {
        &self.global
    }

    pub fn cache(&self) -> &Arc<CacheStore<Payload>> {
        &self.cache
    }

    /// Direct access for reads, subscriptions and cache writes
    pub fn queries(&self) -> &QueryEngine {
        &self.queries
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl Drop for QueryClient {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}
