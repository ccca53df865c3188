//! Cache entry management with TTL support

use crate::cache::types::CacheKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A cache entry with TTL and metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    /// The cache key
    pub key: CacheKey,

    /// The cached value
    pub value: V,

    /// Entry metadata
    pub metadata: CacheMetadata,
}

/// Convert a std duration to a chrono offset, saturating on overflow
pub(crate) fn chrono_duration(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX)
}

fn deadline(from: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    from.checked_add_signed(chrono_duration(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl<V> CacheEntry<V> {
    /// Create a new cache entry expiring `ttl` from now
    pub fn new(key: CacheKey, value: V, ttl: Duration, generation: u64, access_tick: u64) -> Self {
        let now = Utc::now();

        Self {
            key,
            value,
            metadata: CacheMetadata {
                inserted_at: now,
                last_accessed_at: now,
                expires_at: deadline(now, ttl),
                access_tick,
                access_count: 0,
                generation,
            },
        }
    }

    /// Check if the entry has expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Check expiry against a given instant
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.metadata.expires_at
    }

    /// Get time until expiration
    pub fn time_until_expiration(&self) -> Option<Duration> {
        let now = Utc::now();
        if now >= self.metadata.expires_at {
            None
        } else {
            (self.metadata.expires_at - now).to_std().ok()
        }
    }

    /// Mark the entry as accessed (updates LRU clock and count)
    pub fn mark_accessed(&mut self, access_tick: u64) {
        self.metadata.last_accessed_at = Utc::now();
        self.metadata.access_tick = access_tick;
        self.metadata.access_count += 1;
    }

    /// Get the age of the entry since its last write
    pub fn age(&self) -> Duration {
        (Utc::now() - self.metadata.inserted_at)
            .to_std()
            .unwrap_or(Duration::from_secs(0))
    }

    /// Whether the value is older than `stale_time`
    pub fn is_stale(&self, stale_time: Duration) -> bool {
        self.age() >= stale_time
    }

    /// Replace the value, reset timestamps and take a new generation
    pub fn overwrite(&mut self, value: V, ttl: Duration, generation: u64, access_tick: u64) {
        let now = Utc::now();
        self.value = value;
        self.metadata.inserted_at = now;
        self.metadata.last_accessed_at = now;
        self.metadata.expires_at = deadline(now, ttl);
        self.metadata.access_tick = access_tick;
        self.metadata.generation = generation;
    }
}

/// Metadata associated with a cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// When the current value was written
    pub inserted_at: DateTime<Utc>,

    /// Wall-clock time of the last read or write
    pub last_accessed_at: DateTime<Utc>,

    /// Absolute TTL deadline
    pub expires_at: DateTime<Utc>,

    /// Monotonic LRU clock value of the last read or write
    pub access_tick: u64,

    /// Number of cache hits served by this entry
    pub access_count: u64,

    /// Store-wide write clock value of the last write
    pub generation: u64,
}
