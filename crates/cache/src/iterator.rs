//! Pagination cursor cache.
//!
//! A listing snapshot is parked here under a cursor id so follow-up pages
//! come from a stable set. Any write in a zone invalidates that zone's
//! cursors; the next page request then re-runs the listing.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

const DEFAULT_TTL: Duration = Duration::from_secs(120);

struct IteratorState {
    zone_id: String,
    remaining: Vec<String>,
    created_at: Instant,
}

pub struct IteratorCache {
    inner: Mutex<HashMap<Uuid, IteratorState>>,
    ttl: Duration,
}

impl IteratorCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Park a listing snapshot and hand back its cursor.
    pub fn create(&self, zone_id: &str, items: Vec<String>) -> Uuid {
        let cursor = Uuid::new_v4();
        self.inner.lock().insert(
            cursor,
            IteratorState {
                zone_id: zone_id.to_string(),
                remaining: items,
                created_at: Instant::now(),
            },
        );
        cursor
    }

    /// Next page for a cursor; `None` when the cursor is gone (expired,
    /// invalidated, or drained).
    pub fn next_page(&self, cursor: Uuid, page_size: usize) -> Option<Vec<String>> {
        let mut cache = self.inner.lock();
        let state = cache.get_mut(&cursor)?;
        if state.created_at.elapsed() >= self.ttl {
            cache.remove(&cursor);
            return None;
        }
        let take = page_size.min(state.remaining.len());
        let page: Vec<String> = state.remaining.drain(..take).collect();
        if state.remaining.is_empty() {
            cache.remove(&cursor);
        }
        Some(page)
    }

    pub fn invalidate_zone(&self, zone_id: &str) -> usize {
        let mut cache = self.inner.lock();
        let before = cache.len();
        cache.retain(|_, state| state.zone_id != zone_id);
        before - cache.len()
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
}

impl Default for IteratorCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paging_drains_cursor() {
        let cache = IteratorCache::default();
        let cursor = cache.create("z", vec!["a".into(), "b".into(), "c".into()]);

        assert_eq!(cache.next_page(cursor, 2), Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(cache.next_page(cursor, 2), Some(vec!["c".to_string()]));
        assert_eq!(cache.next_page(cursor, 2), None);
    }

    #[test]
    fn test_zone_invalidation_kills_cursor() {
        let cache = IteratorCache::default();
        let cursor = cache.create("z1", vec!["a".into()]);
        let other = cache.create("z2", vec!["b".into()]);

        assert_eq!(cache.invalidate_zone("z1"), 1);
        assert_eq!(cache.next_page(cursor, 10), None);
        assert_eq!(cache.next_page(other, 10), Some(vec!["b".to_string()]));
    }

    #[test]
    fn test_expired_cursor() {
        let cache = IteratorCache::new(Duration::from_millis(0));
        let cursor = cache.create("z", vec!["a".into()]);
        assert_eq!(cache.next_page(cursor, 1), None);
    }
}
