//! L1 check-result cache.
//!
//! Memoizes final permission decisions keyed on the full decision tuple,
//! zone included. Entries live until evicted by the LRU, expired by TTL, or
//! dropped by a targeted subject/object invalidation from the coordinator.
//! Hit rate here is the primary performance signal for the whole stack.

use lru::LruCache;
use nexus_models::Permission;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const DEFAULT_CAPACITY: usize = 100_000;
const DEFAULT_TTL: Duration = Duration::from_secs(5);

/// Full decision tuple for a memoized check.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct CheckKey {
    pub subject_type: String,
    pub subject_id: String,
    pub permission: Permission,
    pub object_type: String,
    pub object_id: String,
    pub zone_id: String,
}

#[derive(Debug, Clone)]
struct CachedDecision {
    allowed: bool,
    computed_at: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct ResultCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
}

pub struct CheckResultCache {
    inner: Mutex<LruCache<CheckKey, CachedDecision>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CheckResultCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &CheckKey) -> Option<bool> {
        let mut cache = self.inner.lock();
        if let Some(entry) = cache.get(key) {
            if entry.computed_at.elapsed() < self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.allowed);
            }
            cache.pop(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn insert(&self, key: CheckKey, allowed: bool) {
        let mut cache = self.inner.lock();
        cache.put(
            key,
            CachedDecision {
                allowed,
                computed_at: Instant::now(),
            },
        );
    }

    /// Drop every entry whose subject matches, within one zone.
    pub fn invalidate_subject(&self, subject_type: &str, subject_id: &str, zone_id: &str) -> usize {
        self.invalidate_where(|k| {
            k.subject_type == subject_type && k.subject_id == subject_id && k.zone_id == zone_id
        })
    }

    /// Drop every entry whose object matches, within one zone.
    pub fn invalidate_object(&self, object_type: &str, object_id: &str, zone_id: &str) -> usize {
        self.invalidate_where(|k| {
            k.object_type == object_type && k.object_id == object_id && k.zone_id == zone_id
        })
    }

    fn invalidate_where(&self, predicate: impl Fn(&CheckKey) -> bool) -> usize {
        let mut cache = self.inner.lock();
        let doomed: Vec<CheckKey> = cache
            .iter()
            .filter(|(k, _)| predicate(k))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            cache.pop(key);
        }
        doomed.len()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ResultCacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        ResultCacheStats {
            hits,
            misses,
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
            size: self.len(),
        }
    }
}

impl Default for CheckResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(subject: &str, object: &str) -> CheckKey {
        CheckKey {
            subject_type: "user".to_string(),
            subject_id: subject.to_string(),
            permission: Permission::Read,
            object_type: "file".to_string(),
            object_id: object.to_string(),
            zone_id: "z1".to_string(),
        }
    }

    #[test]
    fn test_insert_and_get() {
        let cache = CheckResultCache::default();
        cache.insert(key("alice", "/doc"), true);
        assert_eq!(cache.get(&key("alice", "/doc")), Some(true));
        assert_eq!(cache.get(&key("bob", "/doc")), None);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = CheckResultCache::new(16, Duration::from_millis(0));
        cache.insert(key("alice", "/doc"), true);
        assert_eq!(cache.get(&key("alice", "/doc")), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_invalidate_subject() {
        let cache = CheckResultCache::default();
        cache.insert(key("alice", "/a"), true);
        cache.insert(key("alice", "/b"), false);
        cache.insert(key("bob", "/a"), true);

        let dropped = cache.invalidate_subject("user", "alice", "z1");
        assert_eq!(dropped, 2);
        assert_eq!(cache.get(&key("alice", "/a")), None);
        assert_eq!(cache.get(&key("bob", "/a")), Some(true));
    }

    #[test]
    fn test_invalidate_object() {
        let cache = CheckResultCache::default();
        cache.insert(key("alice", "/a"), true);
        cache.insert(key("bob", "/a"), true);
        cache.insert(key("bob", "/b"), true);

        let dropped = cache.invalidate_object("file", "/a", "z1");
        assert_eq!(dropped, 2);
        assert_eq!(cache.get(&key("bob", "/b")), Some(true));
    }

    #[test]
    fn test_wrong_zone_not_invalidated() {
        let cache = CheckResultCache::default();
        cache.insert(key("alice", "/a"), true);
        assert_eq!(cache.invalidate_subject("user", "alice", "z2"), 0);
        assert_eq!(cache.get(&key("alice", "/a")), Some(true));
    }

    #[test]
    fn test_lru_eviction() {
        let cache = CheckResultCache::new(2, Duration::from_secs(60));
        cache.insert(key("alice", "/a"), true);
        cache.insert(key("alice", "/b"), true);
        cache.insert(key("alice", "/c"), true);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&key("alice", "/a")), None);
    }

    #[test]
    fn test_stats_hit_rate() {
        let cache = CheckResultCache::default();
        cache.insert(key("alice", "/a"), true);
        cache.get(&key("alice", "/a"));
        cache.get(&key("alice", "/missing"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }
}
