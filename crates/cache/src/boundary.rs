//! Permission boundary cache.
//!
//! For file-like objects the evaluator records, per subject and permission,
//! the nearest ancestor that granted an inherited permission, or the fact
//! that none did. Repeated "inherited read" checks under the same subtree
//! then short-circuit without touching the tuple store.

use nexus_models::{is_same_or_descendant, Permission};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const DEFAULT_TTL: Duration = Duration::from_secs(60);
const DEFAULT_MAX_ENTRIES: usize = 50_000;

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct BoundaryKey {
    zone_id: String,
    subject_type: String,
    subject_id: String,
    permission: Permission,
    path: String,
}

/// A resolved boundary: the granting ancestor, or `None` when the whole
/// ancestor chain denied.
pub type Boundary = Option<String>;

#[derive(Debug, Clone)]
struct BoundaryEntry {
    granting_ancestor: Boundary,
    computed_at: Instant,
}

pub struct BoundaryCache {
    inner: RwLock<HashMap<BoundaryKey, BoundaryEntry>>,
    ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BoundaryCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            ttl,
            max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Outer `None` is a cache miss; inner value is the boundary itself.
    pub fn get_boundary(
        &self,
        zone_id: &str,
        subject_type: &str,
        subject_id: &str,
        permission: Permission,
        path: &str,
    ) -> Option<Boundary> {
        let key = BoundaryKey {
            zone_id: zone_id.to_string(),
            subject_type: subject_type.to_string(),
            subject_id: subject_id.to_string(),
            permission,
            path: path.to_string(),
        };

        {
            let cache = self.inner.read();
            if let Some(entry) = cache.get(&key) {
                if entry.computed_at.elapsed() < self.ttl {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.granting_ancestor.clone());
                }
            }
        }
        // Expired entries are dropped lazily on the write path.
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn record_boundary(
        &self,
        zone_id: &str,
        subject_type: &str,
        subject_id: &str,
        permission: Permission,
        path: &str,
        granting_ancestor: Boundary,
    ) {
        let mut cache = self.inner.write();
        if cache.len() >= self.max_entries {
            Self::evict_expired_or_oldest(&mut cache, self.ttl);
        }
        cache.insert(
            BoundaryKey {
                zone_id: zone_id.to_string(),
                subject_type: subject_type.to_string(),
                subject_id: subject_id.to_string(),
                permission,
                path: path.to_string(),
            },
            BoundaryEntry {
                granting_ancestor,
                computed_at: Instant::now(),
            },
        );
    }

    /// Invalidation after a tuple change touching `(subject, permission)`.
    ///
    /// Every boundary for that subject and permission in the zone is dropped:
    /// when the changed object was itself an ancestor, descendants' entries
    /// would otherwise keep serving a revoked grant.
    pub fn invalidate_permission_change(
        &self,
        zone_id: &str,
        subject_type: &str,
        subject_id: &str,
        permission: Permission,
        changed_path: &str,
    ) -> usize {
        let mut cache = self.inner.write();
        let before = cache.len();
        cache.retain(|k, _| {
            !(k.zone_id == zone_id
                && k.subject_type == subject_type
                && k.subject_id == subject_id
                && k.permission == permission
                && (is_same_or_descendant(&k.path, changed_path)
                    || is_same_or_descendant(changed_path, &k.path)))
        });
        let dropped = before - cache.len();
        if dropped > 0 {
            tracing::debug!(
                "Boundary invalidation: dropped {} entries for {}:{} {} in zone {}",
                dropped,
                subject_type,
                subject_id,
                permission,
                zone_id
            );
        }
        dropped
    }

    fn evict_expired_or_oldest(cache: &mut HashMap<BoundaryKey, BoundaryEntry>, ttl: Duration) {
        let before = cache.len();
        cache.retain(|_, v| v.computed_at.elapsed() < ttl);
        if cache.len() == before {
            // Nothing expired: drop the oldest tenth.
            let mut entries: Vec<(BoundaryKey, Instant)> = cache
                .iter()
                .map(|(k, v)| (k.clone(), v.computed_at))
                .collect();
            entries.sort_by_key(|(_, at)| *at);
            for (key, _) in entries.iter().take((before / 10).max(1)) {
                cache.remove(key);
            }
        }
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl Default for BoundaryCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positive_boundary_round_trip() {
        let cache = BoundaryCache::default();
        cache.record_boundary("z", "user", "bob", Permission::Read, "/a/b/c", Some("/a".into()));

        let hit = cache.get_boundary("z", "user", "bob", Permission::Read, "/a/b/c");
        assert_eq!(hit, Some(Some("/a".to_string())));
    }

    #[test]
    fn test_negative_boundary_round_trip() {
        let cache = BoundaryCache::default();
        cache.record_boundary("z", "user", "bob", Permission::Read, "/a/b", None);
        assert_eq!(cache.get_boundary("z", "user", "bob", Permission::Read, "/a/b"), Some(None));
    }

    #[test]
    fn test_miss_is_outer_none() {
        let cache = BoundaryCache::default();
        assert_eq!(cache.get_boundary("z", "user", "bob", Permission::Read, "/a"), None);
    }

    #[test]
    fn test_revocation_drops_descendant_entries() {
        let cache = BoundaryCache::default();
        cache.record_boundary("z", "user", "bob", Permission::Read, "/a/b", Some("/a".into()));
        cache.record_boundary("z", "user", "bob", Permission::Read, "/a/c/d", Some("/a".into()));
        cache.record_boundary("z", "user", "bob", Permission::Write, "/a/b", None);

        let dropped =
            cache.invalidate_permission_change("z", "user", "bob", Permission::Read, "/a");
        assert_eq!(dropped, 2);
        // The write-permission entry survives.
        assert_eq!(cache.get_boundary("z", "user", "bob", Permission::Write, "/a/b"), Some(None));
    }

    #[test]
    fn test_other_subject_untouched() {
        let cache = BoundaryCache::default();
        cache.record_boundary("z", "user", "bob", Permission::Read, "/a/b", Some("/a".into()));
        cache.invalidate_permission_change("z", "user", "carol", Permission::Read, "/a");
        assert!(cache.get_boundary("z", "user", "bob", Permission::Read, "/a/b").is_some());
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = BoundaryCache::new(Duration::from_millis(0), 100);
        cache.record_boundary("z", "user", "bob", Permission::Read, "/a/b", Some("/a".into()));
        assert_eq!(cache.get_boundary("z", "user", "bob", Permission::Read, "/a/b"), None);
    }
}
