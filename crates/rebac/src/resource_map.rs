//! Resource-id map: dense integer ids for roaring bitmaps.
//!
//! Bidirectional mapping between `(resource_type, resource_id)` and an
//! append-only `i64`. Resource paths are globally unique, so the key carries
//! no zone column; zone isolation happens at the bitmap level. Ids are never
//! reused or renumbered.

use crate::error::Result;
use chrono::Utc;
use parking_lot::RwLock;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

const BATCH_CHUNK: usize = 500;

pub struct ResourceIdMap {
    pool: SqlitePool,
    forward: RwLock<HashMap<(String, String), i64>>,
    reverse: RwLock<HashMap<i64, (String, String)>>,
}

impl ResourceIdMap {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            forward: RwLock::new(HashMap::new()),
            reverse: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the integer id for a resource. Idempotent; concurrent
    /// callers converge on the same id because the insert is
    /// insert-or-ignore and the select runs after it commits.
    pub async fn intern(&self, resource_type: &str, resource_id: &str) -> Result<i64> {
        let key = (resource_type.to_string(), resource_id.to_string());
        if let Some(id) = self.forward.read().get(&key) {
            return Ok(*id);
        }

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO tiger_resource_map (resource_type, resource_id, created_at)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(resource_type)
        .bind(resource_id)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        let int_id: i64 = sqlx::query_scalar(
            r#"
            SELECT resource_int_id FROM tiger_resource_map
            WHERE resource_type = ?1 AND resource_id = ?2
            "#,
        )
        .bind(resource_type)
        .bind(resource_id)
        .fetch_one(&self.pool)
        .await?;

        self.cache_pair(key, int_id);
        Ok(int_id)
    }

    /// Forward lookup without creating a missing id.
    pub async fn lookup(&self, resource_type: &str, resource_id: &str) -> Result<Option<i64>> {
        let key = (resource_type.to_string(), resource_id.to_string());
        if let Some(id) = self.forward.read().get(&key) {
            return Ok(Some(*id));
        }

        let int_id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT resource_int_id FROM tiger_resource_map
            WHERE resource_type = ?1 AND resource_id = ?2
            "#,
        )
        .bind(resource_type)
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = int_id {
            self.cache_pair(key, id);
        }
        Ok(int_id)
    }

    /// Reverse lookup; `None` for ids never assigned.
    pub async fn resolve(&self, int_id: i64) -> Result<Option<(String, String)>> {
        if let Some(pair) = self.reverse.read().get(&int_id) {
            return Ok(Some(pair.clone()));
        }

        let row: Option<SqliteRow> = sqlx::query(
            r#"
            SELECT resource_type, resource_id FROM tiger_resource_map
            WHERE resource_int_id = ?1
            "#,
        )
        .bind(int_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let pair = (
                    row.get::<String, _>("resource_type"),
                    row.get::<String, _>("resource_id"),
                );
                self.cache_pair(pair.clone(), int_id);
                Ok(Some(pair))
            }
            None => Ok(None),
        }
    }

    /// Look up ids for many resources without creating missing ones.
    /// Resources never interned come back as `None`.
    pub async fn lookup_batch(
        &self,
        resources: &[(String, String)],
    ) -> Result<HashMap<(String, String), Option<i64>>> {
        let mut results: HashMap<(String, String), Option<i64>> = HashMap::new();
        let mut to_fetch: Vec<&(String, String)> = Vec::new();

        {
            let forward = self.forward.read();
            for resource in resources {
                match forward.get(resource) {
                    Some(id) => {
                        results.insert(resource.clone(), Some(*id));
                    }
                    None => {
                        results.insert(resource.clone(), None);
                        to_fetch.push(resource);
                    }
                }
            }
        }

        for chunk in to_fetch.chunks(BATCH_CHUNK) {
            let clause = std::iter::repeat("(resource_type = ? AND resource_id = ?)")
                .take(chunk.len())
                .collect::<Vec<_>>()
                .join(" OR ");
            let sql = format!(
                "SELECT resource_type, resource_id, resource_int_id
                 FROM tiger_resource_map WHERE {clause}"
            );
            let mut q = sqlx::query(&sql);
            for (rtype, rid) in chunk {
                q = q.bind(rtype).bind(rid);
            }
            let rows: Vec<SqliteRow> = q.fetch_all(&self.pool).await?;
            for row in rows {
                let pair = (
                    row.get::<String, _>("resource_type"),
                    row.get::<String, _>("resource_id"),
                );
                let int_id: i64 = row.get("resource_int_id");
                results.insert(pair.clone(), Some(int_id));
                self.cache_pair(pair, int_id);
            }
        }

        Ok(results)
    }

    /// Intern many resources, returning the full mapping.
    pub async fn intern_batch(
        &self,
        resources: &[(String, String)],
    ) -> Result<HashMap<(String, String), i64>> {
        let mut results = HashMap::with_capacity(resources.len());
        for (rtype, rid) in resources {
            let id = self.intern(rtype, rid).await?;
            results.insert((rtype.clone(), rid.clone()), id);
        }
        Ok(results)
    }

    pub fn clear_cache(&self) {
        self.forward.write().clear();
        self.reverse.write().clear();
    }

    fn cache_pair(&self, pair: (String, String), int_id: i64) {
        self.forward.write().insert(pair.clone(), int_id);
        self.reverse.write().insert(int_id, pair);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_database::{schema, Database};

    async fn map() -> ResourceIdMap {
        let db = Database::in_memory().await.unwrap();
        schema::migrate(db.pool()).await.unwrap();
        ResourceIdMap::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_intern_is_idempotent() {
        let map = map().await;
        let id1 = map.intern("file", "/a").await.unwrap();
        let id2 = map.intern("file", "/a").await.unwrap();
        let id3 = map.intern("file", "/b").await.unwrap();

        assert!(id1 > 0);
        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
    }

    #[tokio::test]
    async fn test_resolve_round_trip() {
        let map = map().await;
        let id = map.intern("file", "/my-file").await.unwrap();
        assert_eq!(
            map.resolve(id).await.unwrap(),
            Some(("file".to_string(), "/my-file".to_string()))
        );
        assert_eq!(map.resolve(99_999).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_survives_cache_clear() {
        let map = map().await;
        let id = map.intern("file", "/cached").await.unwrap();
        map.clear_cache();

        assert_eq!(map.intern("file", "/cached").await.unwrap(), id);
        assert_eq!(
            map.resolve(id).await.unwrap(),
            Some(("file".to_string(), "/cached".to_string()))
        );
    }

    #[tokio::test]
    async fn test_lookup_batch_mixes_known_and_unknown() {
        let map = map().await;
        let id = map.intern("file", "/known").await.unwrap();

        let resources = vec![
            ("file".to_string(), "/known".to_string()),
            ("file".to_string(), "/unknown".to_string()),
        ];
        let results = map.lookup_batch(&resources).await.unwrap();
        assert_eq!(results[&resources[0]], Some(id));
        assert_eq!(results[&resources[1]], None);
    }

    #[tokio::test]
    async fn test_intern_batch() {
        let map = map().await;
        let resources: Vec<(String, String)> =
            (0..10).map(|i| ("file".to_string(), format!("/f{}", i))).collect();
        let results = map.intern_batch(&resources).await.unwrap();
        assert_eq!(results.len(), 10);

        let mut ids: Vec<i64> = results.values().copied().collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 10);
    }
}
