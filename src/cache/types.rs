//! Core type definitions for the cache system

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Canonical cache key, as produced by the key codec
pub type CacheKey = String;

/// Type-erased cached value
///
/// The query client stores values of many types in one cache. Each call site
/// recovers its own type with [`Payload::downcast`]; the engine itself never
/// looks inside. Equality is identity: two payloads are equal only when they
/// share the same allocation.
#[derive(Clone)]
pub struct Payload(Arc<dyn Any + Send + Sync>);

impl Payload {
    /// Wrap a value
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Payload(Arc::new(value))
    }

    /// Clone the inner value out if it has type `T`
    pub fn downcast<T: Clone + 'static>(&self) -> Option<T> {
        self.0.downcast_ref::<T>().cloned()
    }

    /// Borrow the inner value if it has type `T`
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Whether the inner value has type `T`
    pub fn is<T: 'static>(&self) -> bool {
        self.0.is::<T>()
    }

    /// Identity comparison
    pub fn ptr_eq(&self, other: &Payload) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.0) as *const (),
            Arc::as_ptr(&other.0) as *const (),
        )
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}

/// Statistics and metrics for cache performance monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CacheStats {
    /// Total number of cache hits
    pub hits: u64,

    /// Total number of cache misses (including logically expired entries)
    pub misses: u64,

    /// Number of entries removed to stay under `max_entries`
    pub evictions: u64,

    /// Number of entries removed because their TTL elapsed
    pub expirations: u64,

    /// Number of entries removed by explicit invalidation
    pub invalidations: u64,

    /// Number of entries currently resident
    pub size: usize,
}

impl CacheStats {
    /// Calculate cache hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Calculate miss rate as a percentage
    pub fn miss_rate(&self) -> f64 {
        100.0 - self.hit_rate()
    }

    /// Total removals not caused by explicit invalidation
    pub fn total_evictions(&self) -> u64 {
        self.evictions + self.expirations
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, hit_rate: {:.2}%, size: {}, evictions: {}, expirations: {} }}",
            self.hits,
            self.misses,
            self.hit_rate(),
            self.size,
            self.evictions,
            self.expirations
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };

        assert_eq!(stats.hit_rate(), 80.0);
        assert_eq!(stats.miss_rate(), 20.0);
    }

    #[test]
    fn test_cache_stats_zero_requests() {
        let stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 0.0);
        assert_eq!(stats.miss_rate(), 100.0);
    }

    #[test]
    fn test_cache_stats_display() {
        let stats = CacheStats {
            hits: 100,
            misses: 50,
            evictions: 10,
            expirations: 5,
            invalidations: 3,
            size: 75,
        };

        let display = format!("{}", stats);
        assert!(display.contains("hits: 100"));
        assert!(display.contains("misses: 50"));
        assert_eq!(stats.total_evictions(), 15);
    }

    #[test]
    fn test_payload_downcast() {
        let payload = Payload::new(vec![1u32, 2, 3]);
        assert!(payload.is::<Vec<u32>>());
        assert_eq!(payload.downcast::<Vec<u32>>(), Some(vec![1, 2, 3]));
        assert_eq!(payload.downcast::<String>(), None);
    }

    #[test]
    fn test_payload_identity_equality() {
        let a = Payload::new("post".to_string());
        let b = a.clone();
        let c = Payload::new("post".to_string());

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
