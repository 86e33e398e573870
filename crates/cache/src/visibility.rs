//! Directory-visibility cache.
//!
//! Answers "does this subject see anything under directory D in zone Z?" so
//! listings can prune empty directories without enumerating descendants.
//! The answer is computed lazily by the evaluator from the subject's bitmap;
//! this layer only remembers it. Invalidation is ancestor-propagating: a
//! change to `/a/b/c` invalidates `/a/b`, `/a`, and `/`.

use nexus_models::{ancestor_paths, normalize_path};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const DEFAULT_TTL: Duration = Duration::from_secs(300);
const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct VisibilityKey {
    zone_id: String,
    subject_type: String,
    subject_id: String,
    dir_path: String,
}

#[derive(Debug, Clone)]
struct VisibilityEntry {
    visible: bool,
    computed_at: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct VisibilityStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
}

pub struct DirVisibilityCache {
    inner: RwLock<HashMap<VisibilityKey, VisibilityEntry>>,
    ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DirVisibilityCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            ttl,
            max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// `Some(bool)` on a live entry, `None` on miss or expiry.
    pub fn is_visible(
        &self,
        zone_id: &str,
        subject_type: &str,
        subject_id: &str,
        dir_path: &str,
    ) -> Option<bool> {
        let key = VisibilityKey {
            zone_id: zone_id.to_string(),
            subject_type: subject_type.to_string(),
            subject_id: subject_id.to_string(),
            dir_path: normalize_path(dir_path),
        };

        let expired = {
            let cache = self.inner.read();
            match cache.get(&key) {
                Some(entry) if entry.computed_at.elapsed() < self.ttl => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.visible);
                }
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            self.inner.write().remove(&key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn set_visible(
        &self,
        zone_id: &str,
        subject_type: &str,
        subject_id: &str,
        dir_path: &str,
        visible: bool,
    ) {
        let mut cache = self.inner.write();
        if cache.len() >= self.max_entries {
            Self::evict_oldest(&mut cache);
        }
        cache.insert(
            VisibilityKey {
                zone_id: zone_id.to_string(),
                subject_type: subject_type.to_string(),
                subject_id: subject_id.to_string(),
                dir_path: normalize_path(dir_path),
            },
            VisibilityEntry {
                visible,
                computed_at: Instant::now(),
            },
        );
    }

    /// Invalidate everything affected by a change at `resource_path`: the
    /// path itself and every cached ancestor directory, for all subjects.
    pub fn invalidate_for_resource(&self, zone_id: &str, resource_path: &str) -> usize {
        let resource_path = normalize_path(resource_path);
        let mut affected: Vec<String> = ancestor_paths(&resource_path);
        affected.push(resource_path);

        let mut cache = self.inner.write();
        let before = cache.len();
        cache.retain(|k, _| k.zone_id != zone_id || !affected.contains(&k.dir_path));
        let dropped = before - cache.len();
        if dropped > 0 {
            tracing::debug!(
                "Visibility invalidation: dropped {} entries in zone {}",
                dropped,
                zone_id
            );
        }
        dropped
    }

    /// Invalidate all entries for one subject in a zone.
    pub fn invalidate_subject(&self, zone_id: &str, subject_type: &str, subject_id: &str) -> usize {
        let mut cache = self.inner.write();
        let before = cache.len();
        cache.retain(|k, _| {
            !(k.zone_id == zone_id
                && k.subject_type == subject_type
                && k.subject_id == subject_id)
        });
        before - cache.len()
    }

    fn evict_oldest(cache: &mut HashMap<VisibilityKey, VisibilityEntry>) {
        let mut entries: Vec<(VisibilityKey, Instant)> =
            cache.iter().map(|(k, v)| (k.clone(), v.computed_at)).collect();
        entries.sort_by_key(|(_, at)| *at);
        let to_remove = (entries.len() / 10).max(1);
        for (key, _) in entries.iter().take(to_remove) {
            cache.remove(key);
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

    pub fn stats(&self) -> VisibilityStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        VisibilityStats {
            hits,
            misses,
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
            size: self.len(),
        }
    }
}

impl Default for DirVisibilityCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}
