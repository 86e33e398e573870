//! In-process zone tuple graph.
//!
//! A snapshot of one zone's tuples, indexed by object, stamped with the zone
//! revision it was built at. The evaluator walks direct grants, ancestor
//! chains, and zone roles against this snapshot instead of issuing one query
//! per hop. A snapshot whose revision no longer matches the counter is dead
//! on arrival; the coordinator additionally drops snapshots eagerly on every
//! write so a rebuilt graph never serves between bump and re-read.

use crate::tuple::TupleRow;
use nexus_models::EntityRef;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub struct ZoneGraph {
    zone_id: String,
    revision: i64,
    by_object: HashMap<(String, String), Vec<TupleRow>>,
    tuple_count: usize,
}

impl ZoneGraph {
    pub fn from_tuples(zone_id: &str, revision: i64, tuples: Vec<TupleRow>) -> Self {
        let tuple_count = tuples.len();
        let mut by_object: HashMap<(String, String), Vec<TupleRow>> = HashMap::new();
        for tuple in tuples {
            by_object
                .entry((tuple.object_type.clone(), tuple.object_id.clone()))
                .or_default()
                .push(tuple);
        }
        Self {
            zone_id: zone_id.to_string(),
            revision,
            by_object,
            tuple_count,
        }
    }

    pub fn zone_id(&self) -> &str {
        &self.zone_id
    }

    pub fn revision(&self) -> i64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.tuple_count
    }

    pub fn is_empty(&self) -> bool {
        self.tuple_count == 0
    }

    /// All tuples attached to an object, any subject.
    pub fn tuples_for(&self, object: &EntityRef) -> &[TupleRow] {
        self.by_object
            .get(&(object.entity_type.clone(), object.entity_id.clone()))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

/// Process-wide cache of zone graphs. Snapshots are immutable behind `Arc`;
/// replacement is a pointer swap.
pub struct ZoneGraphCache {
    inner: RwLock<HashMap<String, Arc<ZoneGraph>>>,
}

impl ZoneGraphCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, zone_id: &str) -> Option<Arc<ZoneGraph>> {
        self.inner.read().get(zone_id).cloned()
    }

    pub fn insert(&self, graph: ZoneGraph) -> Arc<ZoneGraph> {
        let graph = Arc::new(graph);
        self.inner.write().insert(graph.zone_id().to_string(), Arc::clone(&graph));
        graph
    }

    /// Drop one zone's snapshot, or all of them.
    pub fn invalidate(&self, zone_id: Option<&str>) -> usize {
        let mut cache = self.inner.write();
        match zone_id {
            Some(zone) => {
                if cache.remove(zone).is_some() {
                    1
                } else {
                    0
                }
            }
            None => {
                let count = cache.len();
                cache.clear();
                count
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl Default for ZoneGraphCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::{TupleStore, WriteTupleRequest};
    use nexus_database::{schema, Database};

    fn row(subject: &str, relation: &str, object: &str) -> TupleRow {
        TupleRow {
            tuple_id: format!("id-{}-{}", subject, object),
            zone_id: "z1".to_string(),
            subject_type: "user".to_string(),
            subject_id: subject.to_string(),
            relation: relation.to_string(),
            object_type: "file".to_string(),
            object_id: object.to_string(),
            tenant_id: "acme".to_string(),
            subject_tenant_id: "acme".to_string(),
            object_tenant_id: "acme".to_string(),
            expires_at: None,
            created_at: 0,
        }
    }

    #[test]
    fn test_index_by_object() {
        let graph = ZoneGraph::from_tuples(
            "z1",
            3,
            vec![
                row("alice", "viewer", "/a"),
                row("bob", "editor", "/a"),
                row("alice", "viewer", "/b"),
            ],
        );

        assert_eq!(graph.revision(), 3);
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.tuples_for(&EntityRef::file("/a")).len(), 2);
        assert_eq!(graph.tuples_for(&EntityRef::file("/b")).len(), 1);
        assert!(graph.tuples_for(&EntityRef::file("/missing")).is_empty());
    }

    #[test]
    fn test_cache_swap_and_invalidate() {
        let cache = ZoneGraphCache::new();
        cache.insert(ZoneGraph::from_tuples("z1", 1, vec![]));
        cache.insert(ZoneGraph::from_tuples("z2", 1, vec![]));

        // Replacing a snapshot is a swap, not an accumulation.
        cache.insert(ZoneGraph::from_tuples("z1", 2, vec![row("a", "viewer", "/x")]));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("z1").unwrap().revision(), 2);

        assert_eq!(cache.invalidate(Some("z1")), 1);
        assert!(cache.get("z1").is_none());
        assert!(cache.get("z2").is_some());

        assert_eq!(cache.invalidate(None), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_from_store() {
        let db = Database::in_memory().await.unwrap();
        schema::migrate(db.pool()).await.unwrap();
        let store = TupleStore::new(db.pool().clone());
        store
            .write(&WriteTupleRequest::new(
                EntityRef::user("alice"),
                "viewer",
                EntityRef::file("/a"),
                "z1",
                "acme",
            ))
            .await
            .unwrap();

        let revision = store.get_zone_revision("z1").await.unwrap();
        let graph =
            ZoneGraph::from_tuples("z1", revision, store.fetch_zone("z1").await.unwrap());
        assert_eq!(graph.revision(), 1);
        assert_eq!(graph.tuples_for(&EntityRef::file("/a")).len(), 1);
    }
}
