//! Configuration for the cache store

use crate::error::{QueryError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the cache store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL used by [`CacheStore::insert`](crate::cache::CacheStore::insert)
    pub default_ttl: Duration,

    /// Maximum number of resident entries before LRU eviction kicks in
    pub max_entries: usize,

    /// TTL jitter factor (0.0 - 1.0) applied to `default_ttl`
    /// Spreads expiry of entries written together
    pub ttl_jitter: f64,

    /// Run the background expiry sweep
    pub enable_auto_cleanup: bool,

    /// Interval between background expiry sweeps
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            // 5 minutes, matching the default query cache time
            default_ttl: Duration::from_secs(300),
            max_entries: 10_000,
            ttl_jitter: 0.0,
            enable_auto_cleanup: true,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(QueryError::Config(
                "max_entries must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.ttl_jitter) {
            return Err(QueryError::Config(
                "ttl_jitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.enable_auto_cleanup && self.cleanup_interval.is_zero() {
            return Err(QueryError::Config(
                "cleanup_interval must be non-zero when auto cleanup is enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Calculate actual TTL with jitter applied
    pub fn ttl_with_jitter(&self) -> Duration {
        if self.ttl_jitter == 0.0 {
            return self.default_ttl;
        }

        let base_secs = self.default_ttl.as_secs_f64();
        let jitter_range = base_secs * self.ttl_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_secs = (base_secs + jitter).max(0.0);

        Duration::from_secs_f64(final_secs)
    }
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    default_ttl: Option<Duration>,
    max_entries: Option<usize>,
    ttl_jitter: Option<f64>,
    enable_auto_cleanup: Option<bool>,
    cleanup_interval: Option<Duration>,
}

impl CacheConfigBuilder {
    /// Set default TTL for cache entries
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Set maximum number of cache entries
    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    /// Set TTL jitter factor (0.0 - 1.0)
    pub fn ttl_jitter(mut self, jitter: f64) -> Self {
        self.ttl_jitter = Some(jitter);
        self
    }

    /// Enable or disable the background sweep
    pub fn enable_auto_cleanup(mut self, enable: bool) -> Self {
        self.enable_auto_cleanup = Some(enable);
        self
    }

    /// Set cleanup interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            default_ttl: self.default_ttl.unwrap_or(defaults.default_ttl),
            max_entries: self.max_entries.unwrap_or(defaults.max_entries),
            ttl_jitter: self.ttl_jitter.unwrap_or(defaults.ttl_jitter),
            enable_auto_cleanup: self
                .enable_auto_cleanup
                .unwrap_or(defaults.enable_auto_cleanup),
            cleanup_interval: self.cleanup_interval.unwrap_or(defaults.cleanup_interval),
        }
    }
}

/// Preset configurations for common use cases
impl CacheConfig {
    /// Short-lived data such as feeds and presence
    pub fn realtime() -> Self {
        Self {
            default_ttl: Duration::from_secs(30),
            max_entries: 5_000,
            ttl_jitter: 0.1,
            cleanup_interval: Duration::from_secs(10),
            ..Default::default()
        }
    }

    /// Memory-constrained environments
    pub fn small() -> Self {
        Self {
            max_entries: 500,
            cleanup_interval: Duration::from_secs(30),
            ..Default::default()
        }
    }

    /// Large working sets with long-lived entries
    pub fn large() -> Self {
        Self {
            default_ttl: Duration::from_secs(1800),
            max_entries: 250_000,
            ttl_jitter: 0.05,
            cleanup_interval: Duration::from_secs(120),
            ..Default::default()
        }
    }
}
