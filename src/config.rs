//! Engine-wide configuration
//!
//! Values come from code (builders, presets) or from the environment via
//! [`EngineConfig::from_env`], which also loads a `.env` file if present.

use crate::cache::CacheConfig;
use crate::error::{QueryError, Result};
use crate::fetch::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Prefix of every environment variable read by [`EngineConfig::from_env`]
pub const ENV_PREFIX: &str = "OUROBOROS_QUERY_";

/// Defaults applied to queries and mutations that leave an option unset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDefaults {
    /// Age after which a cached value triggers a background refetch
    pub stale_time: Duration,

    /// TTL of fetched values
    pub cache_time: Duration,

    /// Query attempts, the first one included
    pub retry_attempts: u32,

    pub retry_base_delay: Duration,

    pub retry_max_delay: Duration,

    /// Backoff jitter fraction (0.0 - 1.0)
    pub retry_jitter: f64,

    /// Mutation attempts; mutations do not retry unless raised
    pub mutation_retry_attempts: u32,

    /// Per-attempt timeout
    pub request_timeout: Option<Duration>,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            stale_time: Duration::ZERO,
            cache_time: Duration::from_secs(300),
            retry_attempts: retry.max_attempts,
            retry_base_delay: retry.base_delay,
            retry_max_delay: retry.max_delay,
            retry_jitter: retry.jitter,
            mutation_retry_attempts: 1,
            request_timeout: None,
        }
    }
}

impl QueryDefaults {
    /// Retry policy for queries
    pub fn query_retry(&self) -> RetryPolicy {
        self.retry_with_attempts(self.retry_attempts)
    }

    /// Retry policy for mutations
    pub fn mutation_retry(&self) -> RetryPolicy {
        self.retry_with_attempts(self.mutation_retry_attempts)
    }

    fn retry_with_attempts(&self, attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts)
            .with_base_delay(self.retry_base_delay)
            .with_max_delay(self.retry_max_delay)
            .with_jitter(self.retry_jitter)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_time < self.stale_time {
            return Err(QueryError::Config(
                "cache_time must not be shorter than stale_time".to_string(),
            ));
        }

        if self.mutation_retry_attempts == 0 {
            return Err(QueryError::Config(
                "mutation_retry_attempts must be at least 1".to_string(),
            ));
        }

        if matches!(self.request_timeout, Some(timeout) if timeout.is_zero()) {
            return Err(QueryError::Config(
                "request_timeout must be non-zero".to_string(),
            ));
        }

        self.query_retry().validate()
    }
}

/// Complete configuration of a [`QueryClient`](crate::QueryClient)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub queries: QueryDefaults,
}

impl EngineConfig {
    pub fn new(cache: CacheConfig, queries: QueryDefaults) -> Self {
        Self { cache, queries }
    }

    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.queries.validate()
    }

    /// Build a configuration from `OUROBOROS_QUERY_*` variables
    ///
    /// Unset variables keep their defaults:
    ///
    /// | Variable | Unit |
    /// |---|---|
    /// | `DEFAULT_TTL_SECS` | seconds |
    /// | `MAX_ENTRIES` | count |
    /// | `TTL_JITTER` | fraction |
    /// | `AUTO_CLEANUP` | bool |
    /// | `CLEANUP_INTERVAL_SECS` | seconds |
    /// | `STALE_TIME_MS` | milliseconds |
    /// | `CACHE_TIME_SECS` | seconds |
    /// | `RETRY_ATTEMPTS` | count |
    /// | `RETRY_BASE_DELAY_MS` | milliseconds |
    /// | `RETRY_MAX_DELAY_MS` | milliseconds |
    /// | `RETRY_JITTER` | fraction |
    /// | `MUTATION_RETRY_ATTEMPTS` | count |
    /// | `REQUEST_TIMEOUT_MS` | milliseconds |
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenv::dotenv() {
            debug!("Loaded environment from {}", path.display());
        }

        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source
    pub fn from_lookup<L>(lookup: L) -> Result<Self>
    where
        L: Fn(&str) -> Option<String>,
    {
        let read = |suffix: &str| lookup(&format!("{}{}", ENV_PREFIX, suffix));
        let mut config = Self::default();

        if let Some(secs) = parse::<u64>(&read, "DEFAULT_TTL_SECS")? {
            config.cache.default_ttl = Duration::from_secs(secs);
        }
        if let Some(max) = parse::<usize>(&read, "MAX_ENTRIES")? {
            config.cache.max_entries = max;
        }
        if let Some(jitter) = parse::<f64>(&read, "TTL_JITTER")? {
            config.cache.ttl_jitter = jitter;
        }
        if let Some(enabled) = parse::<bool>(&read, "AUTO_CLEANUP")? {
            config.cache.enable_auto_cleanup = enabled;
        }
        if let Some(secs) = parse::<u64>(&read, "CLEANUP_INTERVAL_SECS")? {
            config.cache.cleanup_interval = Duration::from_secs(secs);
        }

        if let Some(ms) = parse::<u64>(&read, "STALE_TIME_MS")? {
            config.queries.stale_time = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>(&read, "CACHE_TIME_SECS")? {
            config.queries.cache_time = Duration::from_secs(secs);
        }
        if let Some(attempts) = parse::<u32>(&read, "RETRY_ATTEMPTS")? {
            config.queries.retry_attempts = attempts;
        }
        if let Some(ms) = parse::<u64>(&read, "RETRY_BASE_DELAY_MS")? {
            config.queries.retry_base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&read, "RETRY_MAX_DELAY_MS")? {
            config.queries.retry_max_delay = Duration::from_millis(ms);
        }
        if let Some(jitter) = parse::<f64>(&read, "RETRY_JITTER")? {
            config.queries.retry_jitter = jitter;
        }
        if let Some(attempts) = parse::<u32>(&read, "MUTATION_RETRY_ATTEMPTS")? {
            config.queries.mutation_retry_attempts = attempts;
        }
        if let Some(ms) = parse::<u64>(&read, "REQUEST_TIMEOUT_MS")? {
            config.queries.request_timeout = Some(Duration::from_millis(ms));
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse<T>(read: &impl Fn(&str) -> Option<String>, suffix: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match read(suffix) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            QueryError::Config(format!("{}{}={:?}: {}", ENV_PREFIX, suffix, raw, e))
        }),
    }
}
