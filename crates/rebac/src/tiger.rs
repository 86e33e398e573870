//! Tiger cache: materialized permissions as roaring bitmaps.
//!
//! For each `(subject, permission, resource_type, zone)` the cache holds the
//! set of resource int-ids the subject can reach, as a durable
//! `RoaringTreemap` blob. Listings and batched checks then collapse to set
//! membership. A bitmap is a derived view: a miss means "ask the tuple
//! store", never "deny".
//!
//! Population runs two ways: a fast-path single-id delta applied by the
//! coordinator under SC zones, and a bounded background rebuild queue for EC
//! zones and repair.

use crate::closure::GroupClosure;
use crate::error::{RebacError, Result};
use crate::resource_map::ResourceIdMap;
use crate::tuple::TupleStore;
use chrono::Utc;
use nexus_models::{relations_granting, EntityRef, Permission};
use roaring::RoaringTreemap;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct TigerConfig {
    /// Zone revisions per cache-key bucket. A bitmap within one bucket of
    /// the current revision is considered fresh enough to serve.
    pub revision_tolerance: i64,
    /// Pending-item cap on the rebuild queue. Overflow is dropped (and
    /// logged); the tuple-store fallback keeps results correct.
    pub queue_capacity: i64,
    /// Poll interval of the background rebuild worker.
    pub rebuild_interval: Duration,
}

impl Default for TigerConfig {
    fn default() -> Self {
        Self {
            revision_tolerance: 16,
            queue_capacity: 10_000,
            rebuild_interval: Duration::from_millis(200),
        }
    }
}

/// A bitmap as read from storage, with the revision bucket it was built at.
#[derive(Debug, Clone)]
pub struct StoredBitmap {
    pub bitmap: RoaringTreemap,
    pub revision_bucket: i64,
}

pub struct TigerCache {
    pool: SqlitePool,
    resource_map: Arc<ResourceIdMap>,
    config: TigerConfig,
}

impl TigerCache {
    pub fn new(pool: SqlitePool, resource_map: Arc<ResourceIdMap>, config: TigerConfig) -> Self {
        Self {
            pool,
            resource_map,
            config,
        }
    }

    pub fn config(&self) -> &TigerConfig {
        &self.config
    }

    pub fn revision_bucket(&self, revision: i64) -> i64 {
        revision / self.config.revision_tolerance.max(1)
    }

    pub async fn get_bitmap(
        &self,
        subject: &EntityRef,
        permission: Permission,
        resource_type: &str,
        zone_id: &str,
    ) -> Result<Option<StoredBitmap>> {
        let row: Option<SqliteRow> = sqlx::query(
            r#"
            SELECT bitmap, revision_bucket FROM tiger_bitmaps
            WHERE subject_type = ?1 AND subject_id = ?2
              AND permission = ?3 AND resource_type = ?4 AND zone_id = ?5
            "#,
        )
        .bind(&subject.entity_type)
        .bind(&subject.entity_id)
        .bind(permission.as_str())
        .bind(resource_type)
        .bind(zone_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let bytes: Vec<u8> = row.get("bitmap");
                Ok(Some(StoredBitmap {
                    bitmap: deserialize_bitmap(&bytes)?,
                    revision_bucket: row.get("revision_bucket"),
                }))
            }
            None => Ok(None),
        }
    }

    /// Upsert a bitmap. The replace is the atomic swap readers see.
    pub async fn store_bitmap(
        &self,
        subject: &EntityRef,
        permission: Permission,
        resource_type: &str,
        zone_id: &str,
        bitmap: &RoaringTreemap,
        revision_bucket: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tiger_bitmaps
                (subject_type, subject_id, permission, resource_type, zone_id,
                 bitmap, revision_bucket, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (subject_type, subject_id, permission, resource_type, zone_id)
            DO UPDATE SET bitmap = excluded.bitmap,
                          revision_bucket = excluded.revision_bucket,
                          updated_at = excluded.updated_at
            "#,
        )
        .bind(&subject.entity_type)
        .bind(&subject.entity_id)
        .bind(permission.as_str())
        .bind(resource_type)
        .bind(zone_id)
        .bind(serialize_bitmap(bitmap)?)
        .bind(revision_bucket)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Membership probe. `None` when there is no bitmap for the key or the
    /// resource was never interned; `Some(false)` is a definite absence from
    /// the materialized set (still subject to staleness under EC).
    pub async fn check_access(
        &self,
        subject: &EntityRef,
        permission: Permission,
        resource_type: &str,
        resource_id: &str,
        zone_id: &str,
    ) -> Result<Option<bool>> {
        let Some(int_id) = self.resource_map.lookup(resource_type, resource_id).await? else {
            return Ok(None);
        };
        let Some(stored) = self.get_bitmap(subject, permission, resource_type, zone_id).await?
        else {
            return Ok(None);
        };
        Ok(Some(stored.bitmap.contains(int_id as u64)))
    }

    pub async fn get_accessible_resources(
        &self,
        subject: &EntityRef,
        permission: Permission,
        resource_type: &str,
        zone_id: &str,
    ) -> Result<Option<RoaringTreemap>> {
        Ok(self
            .get_bitmap(subject, permission, resource_type, zone_id)
            .await?
            .map(|s| s.bitmap))
    }

    /// Fast-path delta: add one id to an existing bitmap. Returns `false`
    /// when there is no bitmap to patch; callers fall back to a rebuild.
    pub async fn add_resource(
        &self,
        subject: &EntityRef,
        permission: Permission,
        resource_type: &str,
        zone_id: &str,
        int_id: i64,
        revision_bucket: i64,
    ) -> Result<bool> {
        let Some(stored) = self.get_bitmap(subject, permission, resource_type, zone_id).await?
        else {
            return Ok(false);
        };
        let mut bitmap = stored.bitmap;
        bitmap.insert(int_id as u64);
        self.store_bitmap(subject, permission, resource_type, zone_id, &bitmap, revision_bucket)
            .await?;
        Ok(true)
    }

    /// Fast-path delta for removal. The id may still be reachable through
    /// another relation; callers that cannot rule that out should enqueue a
    /// rebuild instead.
    pub async fn remove_resource(
        &self,
        subject: &EntityRef,
        permission: Permission,
        resource_type: &str,
        zone_id: &str,
        int_id: i64,
        revision_bucket: i64,
    ) -> Result<bool> {
        let Some(stored) = self.get_bitmap(subject, permission, resource_type, zone_id).await?
        else {
            return Ok(false);
        };
        let mut bitmap = stored.bitmap;
        bitmap.remove(int_id as u64);
        self.store_bitmap(subject, permission, resource_type, zone_id, &bitmap, revision_bucket)
            .await?;
        Ok(true)
    }

    /// Drop stored bitmaps by subject and/or zone; both `None` clears all.
    pub async fn invalidate(
        &self,
        subject: Option<&EntityRef>,
        zone_id: Option<&str>,
    ) -> Result<u64> {
        let result = match (subject, zone_id) {
            (Some(s), Some(z)) => {
                sqlx::query(
                    "DELETE FROM tiger_bitmaps
                     WHERE subject_type = ?1 AND subject_id = ?2 AND zone_id = ?3",
                )
                .bind(&s.entity_type)
                .bind(&s.entity_id)
                .bind(z)
                .execute(&self.pool)
                .await?
            }
            (Some(s), None) => {
                sqlx::query(
                    "DELETE FROM tiger_bitmaps WHERE subject_type = ?1 AND subject_id = ?2",
                )
                .bind(&s.entity_type)
                .bind(&s.entity_id)
                .execute(&self.pool)
                .await?
            }
            (None, Some(z)) => {
                sqlx::query("DELETE FROM tiger_bitmaps WHERE zone_id = ?1")
                    .bind(z)
                    .execute(&self.pool)
                    .await?
            }
            (None, None) => sqlx::query("DELETE FROM tiger_bitmaps").execute(&self.pool).await?,
        };
        Ok(result.rows_affected())
    }

    /// Queue a rebuild work item. Identical pending items coalesce; a full
    /// queue drops the item (`None`) because the fallback path stays correct.
    pub async fn enqueue_rebuild(
        &self,
        subject: &EntityRef,
        permission: Permission,
        resource_type: &str,
        zone_id: &str,
        priority: i64,
    ) -> Result<Option<i64>> {
        let existing: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT queue_id FROM tiger_rebuild_queue
            WHERE processed_at IS NULL
              AND subject_type = ?1 AND subject_id = ?2
              AND permission = ?3 AND resource_type = ?4 AND zone_id = ?5
            "#,
        )
        .bind(&subject.entity_type)
        .bind(&subject.entity_id)
        .bind(permission.as_str())
        .bind(resource_type)
        .bind(zone_id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(queue_id) = existing {
            return Ok(Some(queue_id));
        }

        if self.pending_rebuilds().await? >= self.config.queue_capacity {
            tracing::warn!(
                "Tiger rebuild queue full ({} items); dropping rebuild for {} {} {}",
                self.config.queue_capacity,
                subject,
                permission,
                zone_id
            );
            return Ok(None);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO tiger_rebuild_queue
                (subject_type, subject_id, permission, resource_type, zone_id,
                 priority, enqueued_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&subject.entity_type)
        .bind(&subject.entity_id)
        .bind(permission.as_str())
        .bind(resource_type)
        .bind(zone_id)
        .bind(priority)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(Some(result.last_insert_rowid()))
    }

    /// Monitored signal for queue backpressure.
    pub async fn pending_rebuilds(&self) -> Result<i64> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM tiger_rebuild_queue WHERE processed_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await?)
    }

    /// Pop and run one work item; `false` when the queue is drained.
    pub async fn process_next(&self, store: &TupleStore, closure: &GroupClosure) -> Result<bool> {
        let row: Option<SqliteRow> = sqlx::query(
            r#"
            SELECT queue_id, subject_type, subject_id, permission, resource_type, zone_id
            FROM tiger_rebuild_queue
            WHERE processed_at IS NULL
            ORDER BY priority, queue_id
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(false);
        };

        let queue_id: i64 = row.get("queue_id");
        let subject = EntityRef::new(
            row.get::<String, _>("subject_type"),
            row.get::<String, _>("subject_id"),
        );
        let permission: Permission = row
            .get::<String, _>("permission")
            .parse()
            .map_err(RebacError::InvalidState)?;
        let resource_type: String = row.get("resource_type");
        let zone_id: String = row.get("zone_id");

        self.rebuild(store, closure, &subject, permission, &resource_type, &zone_id).await?;

        sqlx::query("UPDATE tiger_rebuild_queue SET processed_at = ?1 WHERE queue_id = ?2")
            .bind(Utc::now().timestamp())
            .bind(queue_id)
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    /// Authoritative rebuild: enumerate granted objects from the tuple store
    /// (subject plus its transitive groups), intern them, and swap in the
    /// fresh bitmap stamped with the current revision bucket.
    pub async fn rebuild(
        &self,
        store: &TupleStore,
        closure: &GroupClosure,
        subject: &EntityRef,
        permission: Permission,
        resource_type: &str,
        zone_id: &str,
    ) -> Result<u64> {
        let mut subjects = vec![subject.clone()];
        subjects.extend(closure.groups_of(subject).await?);

        let relations = relations_granting(permission);
        let object_ids = store
            .list_objects(&subjects, &relations, resource_type, zone_id, None)
            .await?;

        let mut bitmap = RoaringTreemap::new();
        for object_id in &object_ids {
            let int_id = self.resource_map.intern(resource_type, object_id).await?;
            bitmap.insert(int_id as u64);
        }

        let revision = store.get_zone_revision(zone_id).await?;
        self.store_bitmap(
            subject,
            permission,
            resource_type,
            zone_id,
            &bitmap,
            self.revision_bucket(revision),
        )
        .await?;

        tracing::debug!(
            "Rebuilt bitmap for {} {} {}/{}: {} ids",
            subject,
            permission,
            zone_id,
            resource_type,
            bitmap.len()
        );
        Ok(bitmap.len())
    }

    /// Background worker driving the rebuild queue until cancelled.
    pub fn spawn_rebuilder(
        self: &Arc<Self>,
        store: Arc<TupleStore>,
        closure: Arc<GroupClosure>,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let tiger = Arc::clone(self);
        let interval = tiger.config.rebuild_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        loop {
                            match tiger.process_next(&store, &closure).await {
                                Ok(true) => continue,
                                Ok(false) => break,
                                Err(e) => {
                                    tracing::warn!("Bitmap rebuild failed: {}", e);
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            tracing::debug!("Tiger rebuild worker stopped");
        })
    }
}

fn serialize_bitmap(bitmap: &RoaringTreemap) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    bitmap
        .serialize_into(&mut buf)
        .map_err(|e| RebacError::Internal(format!("Bitmap serialization failed: {}", e)))?;
    Ok(buf)
}

fn deserialize_bitmap(bytes: &[u8]) -> Result<RoaringTreemap> {
    RoaringTreemap::deserialize_from(bytes)
        .map_err(|e| RebacError::Internal(format!("Bitmap deserialization failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closure::DEFAULT_MAX_DEPTH;
    use crate::tuple::WriteTupleRequest;
    use nexus_database::{schema, Database};

    struct Fixture {
        store: TupleStore,
        closure: GroupClosure,
        tiger: Arc<TigerCache>,
        resource_map: Arc<ResourceIdMap>,
    }

    async fn fixture() -> Fixture {
        let db = Database::in_memory().await.unwrap();
        schema::migrate(db.pool()).await.unwrap();
        let resource_map = Arc::new(ResourceIdMap::new(db.pool().clone()));
        Fixture {
            store: TupleStore::new(db.pool().clone()),
            closure: GroupClosure::new(db.pool().clone(), DEFAULT_MAX_DEPTH),
            tiger: Arc::new(TigerCache::new(
                db.pool().clone(),
                Arc::clone(&resource_map),
                TigerConfig::default(),
            )),
            resource_map,
        }
    }

    fn alice() -> EntityRef {
        EntityRef::user("alice")
    }

    #[tokio::test]
    async fn test_store_and_check() {
        let f = fixture().await;
        let r1 = f.resource_map.intern("file", "/f1").await.unwrap();
        let r2 = f.resource_map.intern("file", "/f2").await.unwrap();
        f.resource_map.intern("file", "/f3").await.unwrap();

        let mut bitmap = RoaringTreemap::new();
        bitmap.insert(r1 as u64);
        bitmap.insert(r2 as u64);
        f.tiger
            .store_bitmap(&alice(), Permission::Read, "file", "z1", &bitmap, 0)
            .await
            .unwrap();

        assert_eq!(
            f.tiger.check_access(&alice(), Permission::Read, "file", "/f1", "z1").await.unwrap(),
            Some(true)
        );
        assert_eq!(
            f.tiger.check_access(&alice(), Permission::Read, "file", "/f3", "z1").await.unwrap(),
            Some(false)
        );
    }

    #[tokio::test]
    async fn test_miss_is_none_not_false() {
        let f = fixture().await;
        f.resource_map.intern("file", "/uncached").await.unwrap();
        assert_eq!(
            f.tiger
                .check_access(&EntityRef::user("nobody"), Permission::Read, "file", "/uncached", "z1")
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_invalidate_by_subject() {
        let f = fixture().await;
        let r1 = f.resource_map.intern("file", "/f1").await.unwrap();
        let mut bitmap = RoaringTreemap::new();
        bitmap.insert(r1 as u64);
        f.tiger
            .store_bitmap(&alice(), Permission::Read, "file", "z1", &bitmap, 0)
            .await
            .unwrap();

        let count = f.tiger.invalidate(Some(&alice()), None).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(
            f.tiger.check_access(&alice(), Permission::Read, "file", "/f1", "z1").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_rebuild_from_tuples_with_group_expansion() {
        let f = fixture().await;
        // alice is in devs; devs holds editor on /code; alice holds viewer on /docs.
        f.store
            .write(&WriteTupleRequest::new(
                alice(),
                "member-of",
                EntityRef::group("devs"),
                "z1",
                "acme",
            ))
            .await
            .unwrap();
        f.closure
            .apply_membership_write(&alice(), &EntityRef::group("devs"), "acme")
            .await
            .unwrap();
        f.store
            .write(&WriteTupleRequest::new(
                EntityRef::group("devs"),
                "editor",
                EntityRef::file("/code"),
                "z1",
                "acme",
            ))
            .await
            .unwrap();
        f.store
            .write(&WriteTupleRequest::new(
                alice(),
                "viewer",
                EntityRef::file("/docs"),
                "z1",
                "acme",
            ))
            .await
            .unwrap();

        let count = f
            .tiger
            .rebuild(&f.store, &f.closure, &alice(), Permission::Read, "file", "z1")
            .await
            .unwrap();
        assert_eq!(count, 2);

        assert_eq!(
            f.tiger.check_access(&alice(), Permission::Read, "file", "/code", "z1").await.unwrap(),
            Some(true)
        );
        assert_eq!(
            f.tiger.check_access(&alice(), Permission::Read, "file", "/docs", "z1").await.unwrap(),
            Some(true)
        );

        // Write permission comes only through the group's editor grant.
        f.tiger
            .rebuild(&f.store, &f.closure, &alice(), Permission::Write, "file", "z1")
            .await
            .unwrap();
        assert_eq!(
            f.tiger.check_access(&alice(), Permission::Write, "file", "/docs", "z1").await.unwrap(),
            Some(false)
        );
    }

    #[tokio::test]
    async fn test_queue_coalesces_and_processes() {
        let f = fixture().await;
        f.store
            .write(&WriteTupleRequest::new(alice(), "viewer", EntityRef::file("/a"), "z1", "acme"))
            .await
            .unwrap();

        let id1 = f
            .tiger
            .enqueue_rebuild(&alice(), Permission::Read, "file", "z1", 100)
            .await
            .unwrap()
            .unwrap();
        let id2 = f
            .tiger
            .enqueue_rebuild(&alice(), Permission::Read, "file", "z1", 100)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id1, id2);
        assert_eq!(f.tiger.pending_rebuilds().await.unwrap(), 1);

        assert!(f.tiger.process_next(&f.store, &f.closure).await.unwrap());
        assert!(!f.tiger.process_next(&f.store, &f.closure).await.unwrap());
        assert_eq!(f.tiger.pending_rebuilds().await.unwrap(), 0);

        assert_eq!(
            f.tiger.check_access(&alice(), Permission::Read, "file", "/a", "z1").await.unwrap(),
            Some(true)
        );
    }

    #[tokio::test]
    async fn test_queue_capacity_drops_overflow() {
        let db = Database::in_memory().await.unwrap();
        schema::migrate(db.pool()).await.unwrap();
        let resource_map = Arc::new(ResourceIdMap::new(db.pool().clone()));
        let tiger = TigerCache::new(
            db.pool().clone(),
            resource_map,
            TigerConfig {
                queue_capacity: 1,
                ..TigerConfig::default()
            },
        );

        let first = tiger
            .enqueue_rebuild(&alice(), Permission::Read, "file", "z1", 100)
            .await
            .unwrap();
        assert!(first.is_some());
        let overflow = tiger
            .enqueue_rebuild(&EntityRef::user("bob"), Permission::Read, "file", "z1", 100)
            .await
            .unwrap();
        assert!(overflow.is_none());
    }

    #[tokio::test]
    async fn test_fast_path_delta() {
        let f = fixture().await;
        let r1 = f.resource_map.intern("file", "/f1").await.unwrap();
        let r2 = f.resource_map.intern("file", "/f2").await.unwrap();

        // No bitmap yet: delta reports not-applied.
        assert!(!f
            .tiger
            .add_resource(&alice(), Permission::Read, "file", "z1", r1, 0)
            .await
            .unwrap());

        let mut bitmap = RoaringTreemap::new();
        bitmap.insert(r1 as u64);
        f.tiger
            .store_bitmap(&alice(), Permission::Read, "file", "z1", &bitmap, 0)
            .await
            .unwrap();

        assert!(f
            .tiger
            .add_resource(&alice(), Permission::Read, "file", "z1", r2, 0)
            .await
            .unwrap());
        assert_eq!(
            f.tiger.check_access(&alice(), Permission::Read, "file", "/f2", "z1").await.unwrap(),
            Some(true)
        );

        assert!(f
            .tiger
            .remove_resource(&alice(), Permission::Read, "file", "z1", r1, 0)
            .await
            .unwrap());
        assert_eq!(
            f.tiger.check_access(&alice(), Permission::Read, "file", "/f1", "z1").await.unwrap(),
            Some(false)
        );
    }
}
