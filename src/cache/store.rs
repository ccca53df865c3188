//! Main cache store implementation with TTL expiry, LRU eviction and
//! pattern invalidation

use crate::cache::{
    config::CacheConfig,
    entry::{CacheEntry, CacheMetadata},
    invalidation::{InvalidationEvent, InvalidationPattern, InvalidationReason},
    types::{CacheKey, CacheStats},
};
use crate::error::Result;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// In-memory key/value store with TTL support and LRU eviction
///
/// This implementation provides:
/// - Per-key write exclusion via a sharded map; reads proceed concurrently
///   with writes to unrelated keys
/// - Lazy TTL expiry on read plus a background sweep
/// - LRU eviction once `max_entries` is exceeded
/// - A store-wide write clock that stamps every write with a generation
/// - Exact snapshots for optimistic rollback
///
/// All operations are synchronous; none of them suspend.
pub struct CacheStore<V> {
    /// Cache configuration
    pub(crate) config: CacheConfig,

    /// Main storage: key -> entry
    entries: DashMap<CacheKey, CacheEntry<V>>,

    /// LRU clock, advanced on every read hit and write
    lru_clock: AtomicU64,

    /// Write clock, source of entry generations
    write_clock: AtomicU64,

    counters: StatCounters,
}

#[derive(Default)]
struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
}

impl StatCounters {
    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

impl<V> CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a new cache with the given configuration
    pub fn new(config: CacheConfig) -> Self {
        info!("Initializing cache store with config: {:?}", config);

        Self {
            config,
            entries: DashMap::new(),
            lru_clock: AtomicU64::new(0),
            write_clock: AtomicU64::new(0),
            counters: StatCounters::default(),
        }
    }

    /// The configuration this store was built with
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn tick(&self) -> u64 {
        self.lru_clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn next_generation(&self) -> u64 {
        self.write_clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Get a value from the cache
    ///
    /// Missing and logically expired entries are both reported as absent.
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_entry(key).map(|entry| entry.value)
    }

    /// Get a full entry, counting a hit or miss and refreshing its LRU clock
    pub fn get_entry(&self, key: &str) -> Option<CacheEntry<V>> {
        let found = match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired() => {
                entry.mark_accessed(self.tick());
                Some((*entry).clone())
            }
            Some(_) => {
                // Left resident until the sweep removes it
                debug!("Cache entry expired: {}", key);
                None
            }
            None => None,
        };

        if found.is_some() {
            StatCounters::add(&self.counters.hits, 1);
            debug!("Cache hit: {}", key);
        } else {
            StatCounters::add(&self.counters.misses, 1);
            debug!("Cache miss: {}", key);
        }

        found
    }

    /// Read an unexpired entry without touching statistics or LRU order
    pub fn peek(&self, key: &str) -> Option<CacheEntry<V>> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| (*entry).clone())
    }

    /// Generation of the resident entry for `key`, or 0 when absent
    pub fn generation(&self, key: &str) -> u64 {
        self.entries
            .get(key)
            .map(|entry| entry.metadata.generation)
            .unwrap_or(0)
    }

    /// Insert a value with the default TTL (jitter applied)
    pub fn insert(&self, key: impl Into<CacheKey>, value: V) -> u64 {
        self.set(key, value, self.config.ttl_with_jitter())
    }

    /// Insert or overwrite a value, returning its new generation
    pub fn set(&self, key: impl Into<CacheKey>, value: V, ttl: Duration) -> u64 {
        let generation = self.set_without_eviction(key, value, ttl);
        self.evict_if_needed();
        generation
    }

    /// Like [`set`](Self::set), but never evicts
    ///
    /// The store may stay above `max_entries` until the next eviction check.
    pub(crate) fn set_without_eviction(&self, key: impl Into<CacheKey>, value: V, ttl: Duration) -> u64 {
        let key = key.into();

        // The generation is drawn while the key's shard is locked, so per-key
        // generations are committed in the order they were assigned.
        let generation = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let generation = self.next_generation();
                occupied
                    .get_mut()
                    .overwrite(value, ttl, generation, self.tick());
                debug!("Updating existing cache entry: {} (generation {})", key, generation);
                generation
            }
            Entry::Vacant(vacant) => {
                let generation = self.next_generation();
                vacant.insert(CacheEntry::new(key.clone(), value, ttl, generation, self.tick()));
                debug!("Inserting new cache entry: {} (generation {})", key, generation);
                generation
            }
        };

        generation
    }

    /// Write `value` only if nothing newer than `expected` has been committed
    ///
    /// Returns the new generation, or `None` when the write was superseded.
    pub fn set_if_generation(
        &self,
        key: impl Into<CacheKey>,
        value: V,
        ttl: Duration,
        expected: u64,
    ) -> Option<u64> {
        let key = key.into();

        let committed = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().metadata.generation > expected {
                    None
                } else {
                    let generation = self.next_generation();
                    occupied
                        .get_mut()
                        .overwrite(value, ttl, generation, self.tick());
                    Some(generation)
                }
            }
            Entry::Vacant(vacant) => {
                let generation = self.next_generation();
                vacant.insert(CacheEntry::new(key.clone(), value, ttl, generation, self.tick()));
                Some(generation)
            }
        };

        match committed {
            Some(generation) => {
                debug!("Committed result for {} (generation {})", key, generation);
                self.evict_if_needed();
            }
            None => debug!("Discarding superseded result for {} (dispatched at generation {})", key, expected),
        }

        committed
    }

    /// Check if a key holds an unexpired value (without updating access time)
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|entry| !entry.is_expired())
            .unwrap_or(false)
    }

    /// Remove a specific entry from the cache
    pub fn remove(&self, key: &str) -> Option<V> {
        let (_, entry) = self.entries.remove(key)?;
        StatCounters::add(&self.counters.invalidations, 1);
        debug!("Removed cache entry: {}", key);
        Some(entry.value)
    }

    /// Invalidate every entry matching a pattern string
    ///
    /// `"posts:*"` removes `"posts:1"` and `"posts:2:comments"`; a pattern
    /// without `*` removes one exact key.
    pub fn invalidate(&self, pattern: &str) -> Result<usize> {
        let pattern = InvalidationPattern::parse(pattern)?;
        Ok(self.invalidate_pattern(&pattern))
    }

    /// Invalidate every entry matching a parsed pattern
    ///
    /// Each entry is removed under its shard lock, so a concurrent reader sees
    /// either the whole entry or nothing.
    pub fn invalidate_pattern(&self, pattern: &InvalidationPattern) -> usize {
        let removed = match pattern.as_exact() {
            Some(key) => usize::from(self.entries.remove(key).is_some()),
            None => {
                let mut removed = 0;
                self.entries.retain(|key, _| {
                    if pattern.matches(key) {
                        removed += 1;
                        false
                    } else {
                        true
                    }
                });
                removed
            }
        };

        StatCounters::add(&self.counters.invalidations, removed as u64);
        info!("Invalidated {} entries matching pattern: {}", removed, pattern);
        removed
    }

    /// Clear all entries from the cache
    pub fn clear(&self) {
        let count = self.entries.len();
        self.entries.clear();
        StatCounters::add(&self.counters.invalidations, count as u64);

        info!("Cleared {} entries from cache", count);
    }

    /// Remove all expired entries
    pub fn cleanup_expired(&self) -> Vec<InvalidationEvent> {
        let now = Utc::now();
        let mut expired_keys = Vec::new();

        self.entries.retain(|key, entry| {
            if entry.is_expired_at(now) {
                expired_keys.push(key.clone());
                false
            } else {
                true
            }
        });

        if expired_keys.is_empty() {
            return Vec::new();
        }

        StatCounters::add(&self.counters.expirations, expired_keys.len() as u64);
        debug!("Cleaned up {} expired entries", expired_keys.len());

        let count = expired_keys.len();
        vec![InvalidationEvent::new(InvalidationReason::Expired, expired_keys)
            .with_context(format!("Cleaned up {} expired entries", count))]
    }

    /// Capture the exact state of `keys`, including their absence
    pub fn snapshot(&self, keys: &[CacheKey]) -> CacheSnapshot<V> {
        let entries = keys
            .iter()
            .map(|key| {
                let saved = self.entries.get(key).map(|entry| SnapshotEntry {
                    value: entry.value.clone(),
                    metadata: entry.metadata.clone(),
                });
                (key.clone(), saved)
            })
            .collect();

        CacheSnapshot { entries }
    }

    /// Capture every resident entry, ordered by key
    pub fn snapshot_all(&self) -> CacheSnapshot<V> {
        let mut keys: Vec<CacheKey> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        self.snapshot(&keys)
    }

    /// Put every key of `snapshot` back into its captured state
    ///
    /// Restored entries keep their captured timestamps and LRU position but
    /// take a fresh generation, so fetches dispatched against the replaced
    /// state cannot commit over them.
    pub fn restore(&self, snapshot: &CacheSnapshot<V>) -> Vec<CacheKey> {
        let mut restored = Vec::with_capacity(snapshot.entries.len());

        for (key, saved) in &snapshot.entries {
            match saved {
                Some(saved) => {
                    let generation = self.next_generation();
                    let entry = CacheEntry {
                        key: key.clone(),
                        value: saved.value.clone(),
                        metadata: CacheMetadata {
                            generation,
                            ..saved.metadata.clone()
                        },
                    };
                    self.entries.insert(key.clone(), entry);
                }
                None => {
                    self.entries.remove(key);
                }
            }
            restored.push(key.clone());
        }

        debug!("Restored {} entries from snapshot", restored.len());
        self.evict_if_needed();
        restored
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            size: self.entries.len(),
        }
    }

    /// Get number of resident entries (expired ones included until swept)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn evict_if_needed(&self) {
        if self.entries.len() > self.config.max_entries {
            self.evict();
        }
    }

    /// Shrink the store to `max_entries`
    ///
    /// Expired entries go first. After that entries leave in ascending LRU
    /// clock order, ties broken by the earlier `expires_at`.
    fn evict(&self) {
        let max_entries = self.config.max_entries;

        let now = Utc::now();
        let mut expired = 0u64;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired_at(now);
            if !keep {
                expired += 1;
            }
            keep
        });
        StatCounters::add(&self.counters.expirations, expired);

        while self.entries.len() > max_entries {
            let victim = self
                .entries
                .iter()
                .min_by_key(|entry| (entry.metadata.access_tick, entry.metadata.expires_at))
                .map(|entry| (entry.key().clone(), entry.metadata.access_tick));

            let Some((key, tick)) = victim else {
                break;
            };

            // Skip the victim if a reader refreshed it since the scan
            if self
                .entries
                .remove_if(&key, |_, entry| entry.metadata.access_tick == tick)
                .is_some()
            {
                StatCounters::add(&self.counters.evictions, 1);
                debug!("Evicting entry due to max_entries limit: {}", key);
            }
        }
    }
}

/// Saved state of one entry
#[derive(Debug, Clone)]
pub struct SnapshotEntry<V> {
    pub value: V,
    pub metadata: CacheMetadata,
}

impl<V: PartialEq> PartialEq for SnapshotEntry<V> {
    fn eq(&self, other: &Self) -> bool {
        // Generations are bookkeeping for write ordering, not cache content
        self.value == other.value
            && self.metadata.inserted_at == other.metadata.inserted_at
            && self.metadata.expires_at == other.metadata.expires_at
            && self.metadata.last_accessed_at == other.metadata.last_accessed_at
            && self.metadata.access_tick == other.metadata.access_tick
            && self.metadata.access_count == other.metadata.access_count
    }
}

/// Exact capture of a set of keys, absent keys included
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSnapshot<V> {
    entries: Vec<(CacheKey, Option<SnapshotEntry<V>>)>,
}

impl<V> CacheSnapshot<V> {
    /// Keys covered by this snapshot
    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.entries.iter().map(|(key, _)| key)
    }

    /// Saved state of one key; `Some(None)` means the key was absent
    pub fn get(&self, key: &str) -> Option<Option<&SnapshotEntry<V>>> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, saved)| saved.as_ref())
    }

    /// Whether the snapshot covers `key`
    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Number of keys covered
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are covered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append keys from another snapshot; keys already covered keep their
    /// earlier state
    pub(crate) fn merge(&mut self, other: Self) {
        for (key, saved) in other.entries {
            if !self.contains(&key) {
                self.entries.push((key, saved));
            }
        }
    }

    pub(crate) fn empty() -> Self {
        Self { entries: Vec::new() }
    }
}

/// Background task for automatic cache cleanup
///
/// The task holds only a weak reference and ends once the store is dropped.
pub fn start_auto_cleanup<V>(cache: &Arc<CacheStore<V>>) -> JoinHandle<()>
where
    V: Clone + Send + Sync + 'static,
{
    let interval = cache.config.cleanup_interval;
    let weak = Arc::downgrade(cache);

    info!("Starting automatic cache cleanup task (interval: {:?})", interval);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(cache) = weak.upgrade() else {
                debug!("Cache dropped, stopping cleanup task");
                break;
            };

            let events = cache.cleanup_expired();
            if !events.is_empty() {
                debug!("Auto cleanup: {} events", events.len());
            }
        }
    })
}
