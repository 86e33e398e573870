//! Persistent namespace views.
//!
//! An agent's namespace is the set of mount points it can see. Deriving it
//! means intersecting the agent's granted objects with the mount table, so
//! the result is persisted: a reconnecting agent gets its filtered namespace
//! back without a ReBAC rebuild. A stored view is served only while its
//! grants hash still matches and its revision bucket has not drifted past
//! the tolerance window.

use crate::engine::PolicyEngine;
use crate::error::Result;
use chrono::Utc;
use nexus_models::{is_same_or_descendant, EntityRef, Permission};
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MountPoint {
    pub path: String,
    pub backend: String,
}

#[derive(Debug, Clone)]
pub struct NamespaceView {
    pub subject: EntityRef,
    pub zone_id: String,
    pub mount_paths: Vec<String>,
    pub grants_hash: String,
    pub revision_bucket: i64,
    pub created_at: i64,
}

#[derive(Clone)]
pub struct NamespaceViewStore {
    pool: SqlitePool,
}

impl NamespaceViewStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Derive the subject's visible mount set, persist it, and return it.
    pub async fn derive(
        &self,
        engine: &PolicyEngine,
        subject: &EntityRef,
        zone_id: &str,
        mounts: &[MountPoint],
        revision_bucket: i64,
    ) -> Result<NamespaceView> {
        let mut grants = engine
            .list_accessible(subject, Permission::Read, "file", zone_id, None)
            .await?;
        grants.sort_unstable();

        let mut visible: Vec<&MountPoint> = mounts
            .iter()
            .filter(|mount| {
                grants.iter().any(|p| {
                    is_same_or_descendant(p, &mount.path) || is_same_or_descendant(&mount.path, p)
                })
            })
            .collect();
        visible.sort_by(|a, b| a.path.cmp(&b.path));

        // Minimal prefix set: a mount nested under another visible mount
        // adds nothing.
        let mut mount_paths: Vec<String> = Vec::new();
        for mount in visible {
            let covered = mount_paths
                .iter()
                .any(|kept| kept != &mount.path && is_same_or_descendant(&mount.path, kept));
            if !covered {
                mount_paths.push(mount.path.clone());
            }
        }

        let view = NamespaceView {
            subject: subject.clone(),
            zone_id: zone_id.to_string(),
            mount_paths,
            grants_hash: grants_hash(&grants),
            revision_bucket,
            created_at: Utc::now().timestamp(),
        };
        self.persist(&view).await?;
        Ok(view)
    }

    async fn persist(&self, view: &NamespaceView) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO persistent_namespace_views
                (subject_type, subject_id, zone_id, mount_paths, grants_hash,
                 revision_bucket, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (subject_type, subject_id, zone_id)
            DO UPDATE SET mount_paths = excluded.mount_paths,
                          grants_hash = excluded.grants_hash,
                          revision_bucket = excluded.revision_bucket,
                          created_at = excluded.created_at
            "#,
        )
        .bind(&view.subject.entity_type)
        .bind(&view.subject.entity_id)
        .bind(&view.zone_id)
        .bind(serde_json::to_string(&view.mount_paths).unwrap_or_else(|_| "[]".to_string()))
        .bind(&view.grants_hash)
        .bind(view.revision_bucket)
        .bind(view.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load(&self, subject: &EntityRef, zone_id: &str) -> Result<Option<NamespaceView>> {
        let row: Option<SqliteRow> = sqlx::query(
            r#"
            SELECT mount_paths, grants_hash, revision_bucket, created_at
            FROM persistent_namespace_views
            WHERE subject_type = ?1 AND subject_id = ?2 AND zone_id = ?3
            "#,
        )
        .bind(&subject.entity_type)
        .bind(&subject.entity_id)
        .bind(zone_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| NamespaceView {
            subject: subject.clone(),
            zone_id: zone_id.to_string(),
            mount_paths: serde_json::from_str(&row.get::<String, _>("mount_paths"))
                .unwrap_or_default(),
            grants_hash: row.get("grants_hash"),
            revision_bucket: row.get("revision_bucket"),
            created_at: row.get("created_at"),
        }))
    }

    /// Load only when the stored view's revision bucket is within one bucket
    /// of the current one; stale views are for rebuilding, not serving.
    pub async fn load_if_fresh(
        &self,
        subject: &EntityRef,
        zone_id: &str,
        current_bucket: i64,
    ) -> Result<Option<NamespaceView>> {
        Ok(self
            .load(subject, zone_id)
            .await?
            .filter(|view| (current_bucket - view.revision_bucket).abs() <= 1))
    }

    pub async fn invalidate(&self, subject: &EntityRef, zone_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM persistent_namespace_views
            WHERE subject_type = ?1 AND subject_id = ?2 AND zone_id = ?3
            "#,
        )
        .bind(&subject.entity_type)
        .bind(&subject.entity_id)
        .bind(zone_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn grants_hash(grants: &[String]) -> String {
    let mut hasher = Sha256::new();
    for grant in grants {
        hasher.update(grant.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::fixture;
    use crate::tuple::WriteTupleRequest;

    fn mounts() -> Vec<MountPoint> {
        vec![
            MountPoint { path: "/docs".into(), backend: "local".into() },
            MountPoint { path: "/docs/archive".into(), backend: "local".into() },
            MountPoint { path: "/code".into(), backend: "local".into() },
            MountPoint { path: "/private".into(), backend: "local".into() },
        ]
    }

    #[tokio::test]
    async fn test_derive_keeps_minimal_visible_set() {
        let f = fixture().await;
        f.store
            .write(&WriteTupleRequest::new(
                EntityRef::user("alice"),
                "viewer",
                EntityRef::file("/docs"),
                "z1",
                "acme",
            ))
            .await
            .unwrap();
        f.store
            .write(&WriteTupleRequest::new(
                EntityRef::user("alice"),
                "viewer",
                EntityRef::file("/code/main.rs"),
                "z1",
                "acme",
            ))
            .await
            .unwrap();

        let views = NamespaceViewStore::new(f.store.pool().clone());
        let view = views
            .derive(&f.engine, &EntityRef::user("alice"), "z1", &mounts(), 0)
            .await
            .unwrap();

        // /docs/archive collapses into /docs; /private is invisible.
        assert_eq!(view.mount_paths, vec!["/code".to_string(), "/docs".to_string()]);
        assert!(!view.grants_hash.is_empty());
    }

    #[tokio::test]
    async fn test_persisted_view_round_trips() {
        let f = fixture().await;
        f.store
            .write(&WriteTupleRequest::new(
                EntityRef::user("alice"),
                "viewer",
                EntityRef::file("/docs"),
                "z1",
                "acme",
            ))
            .await
            .unwrap();

        let views = NamespaceViewStore::new(f.store.pool().clone());
        let derived = views
            .derive(&f.engine, &EntityRef::user("alice"), "z1", &mounts(), 3)
            .await
            .unwrap();

        let loaded = views.load(&EntityRef::user("alice"), "z1").await.unwrap().unwrap();
        assert_eq!(loaded.mount_paths, derived.mount_paths);
        assert_eq!(loaded.grants_hash, derived.grants_hash);
        assert_eq!(loaded.revision_bucket, 3);
    }

    #[tokio::test]
    async fn test_stale_view_not_served() {
        let f = fixture().await;
        let views = NamespaceViewStore::new(f.store.pool().clone());
        views
            .derive(&f.engine, &EntityRef::user("alice"), "z1", &mounts(), 0)
            .await
            .unwrap();

        assert!(views
            .load_if_fresh(&EntityRef::user("alice"), "z1", 1)
            .await
            .unwrap()
            .is_some());
        assert!(views
            .load_if_fresh(&EntityRef::user("alice"), "z1", 5)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_invalidate() {
        let f = fixture().await;
        let views = NamespaceViewStore::new(f.store.pool().clone());
        views
            .derive(&f.engine, &EntityRef::user("alice"), "z1", &mounts(), 0)
            .await
            .unwrap();

        assert!(views.invalidate(&EntityRef::user("alice"), "z1").await.unwrap());
        assert!(views.load(&EntityRef::user("alice"), "z1").await.unwrap().is_none());
        assert!(!views.invalidate(&EntityRef::user("alice"), "z1").await.unwrap());
    }
}
