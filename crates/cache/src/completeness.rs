//! Bitmap completeness flags.
//!
//! A subject with no directory-level grants in a zone has a bitmap that
//! already contains every object it can reach, so the evaluator may skip the
//! ancestor-inheritance fallback entirely. Only positive findings are
//! cached; any directory-grant change drops the flag so the next query
//! recomputes it from the directory bitmap rather than trusting a stale
//! answer.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const DEFAULT_TTL: Duration = Duration::from_secs(3600);

pub struct BitmapCompletenessCache {
    inner: RwLock<HashMap<(String, String, String), Instant>>,
    ttl: Duration,
}

impl BitmapCompletenessCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn is_complete(&self, subject_type: &str, subject_id: &str, zone_id: &str) -> bool {
        let key = (
            subject_type.to_string(),
            subject_id.to_string(),
            zone_id.to_string(),
        );
        let cache = self.inner.read();
        match cache.get(&key) {
            Some(marked_at) => marked_at.elapsed() < self.ttl,
            None => false,
        }
    }

    pub fn mark_complete(&self, subject_type: &str, subject_id: &str, zone_id: &str) {
        self.inner.write().insert(
            (
                subject_type.to_string(),
                subject_id.to_string(),
                zone_id.to_string(),
            ),
            Instant::now(),
        );
    }

    pub fn invalidate(&self, subject_type: &str, subject_id: &str, zone_id: &str) {
        self.inner.write().remove(&(
            subject_type.to_string(),
            subject_id.to_string(),
            zone_id.to_string(),
        ));
    }

    pub fn invalidate_zone(&self, zone_id: &str) -> usize {
        let mut cache = self.inner.write();
        let before = cache.len();
        cache.retain(|(_, _, z), _| z != zone_id);
        before - cache.len()
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
}

impl Default for BitmapCompletenessCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_subject_is_not_complete() {
        let cache = BitmapCompletenessCache::default();
        assert!(!cache.is_complete("user", "alice", "z"));
    }

    #[test]
    fn test_mark_and_invalidate() {
        let cache = BitmapCompletenessCache::default();
        cache.mark_complete("user", "alice", "z");
        assert!(cache.is_complete("user", "alice", "z"));

        cache.invalidate("user", "alice", "z");
        assert!(!cache.is_complete("user", "alice", "z"));
    }

    #[test]
    fn test_zone_invalidation() {
        let cache = BitmapCompletenessCache::default();
        cache.mark_complete("user", "alice", "z1");
        cache.mark_complete("user", "bob", "z1");
        cache.mark_complete("user", "alice", "z2");

        assert_eq!(cache.invalidate_zone("z1"), 2);
        assert!(cache.is_complete("user", "alice", "z2"));
    }

    #[test]
    fn test_ttl() {
        let cache = BitmapCompletenessCache::new(Duration::from_millis(0));
        cache.mark_complete("user", "alice", "z");
        assert!(!cache.is_complete("user", "alice", "z"));
    }
}
