//! Schema bootstrap for the authoritative store.
//!
//! Every statement is idempotent (`IF NOT EXISTS`) so `migrate` can run on
//! each startup. Timestamps are epoch seconds; expiry is enforced at read
//! time by the evaluator, never by a sweeper.

use crate::error::Result;
use sqlx::SqlitePool;

const STATEMENTS: &[&str] = &[
    // Authoritative permission tuples. Updates are delete+insert; the
    // six-column key below is the tuple identity.
    r#"
    CREATE TABLE IF NOT EXISTS rebac_tuples (
        tuple_id TEXT PRIMARY KEY,
        zone_id TEXT NOT NULL,
        subject_type TEXT NOT NULL,
        subject_id TEXT NOT NULL,
        relation TEXT NOT NULL,
        object_type TEXT NOT NULL,
        object_id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        subject_tenant_id TEXT NOT NULL,
        object_tenant_id TEXT NOT NULL,
        expires_at INTEGER,
        created_at INTEGER NOT NULL,
        UNIQUE (zone_id, subject_type, subject_id, relation, object_type, object_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_rebac_tuples_object
         ON rebac_tuples (zone_id, object_type, object_id)",
    "CREATE INDEX IF NOT EXISTS idx_rebac_tuples_subject
         ON rebac_tuples (zone_id, subject_type, subject_id)",
    "CREATE INDEX IF NOT EXISTS idx_rebac_tuples_relation
         ON rebac_tuples (zone_id, relation)",
    // Precomputed transitive member-of closure.
    r#"
    CREATE TABLE IF NOT EXISTS rebac_group_closure (
        member_type TEXT NOT NULL,
        member_id TEXT NOT NULL,
        group_type TEXT NOT NULL,
        group_id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        depth INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (member_type, member_id, group_type, group_id, tenant_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_group_closure_group
         ON rebac_group_closure (group_type, group_id)",
    // Per-zone monotonic write counter; caches key off coarse buckets of it.
    r#"
    CREATE TABLE IF NOT EXISTS zone_revisions (
        zone_id TEXT PRIMARY KEY,
        revision INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS zones (
        zone_id TEXT PRIMARY KEY,
        consistency_mode TEXT NOT NULL DEFAULT 'EC',
        created_at INTEGER NOT NULL
    )
    "#,
    // Resource paths are globally unique, so the map carries no zone column.
    r#"
    CREATE TABLE IF NOT EXISTS tiger_resource_map (
        resource_int_id INTEGER PRIMARY KEY AUTOINCREMENT,
        resource_type TEXT NOT NULL,
        resource_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE (resource_type, resource_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tiger_bitmaps (
        subject_type TEXT NOT NULL,
        subject_id TEXT NOT NULL,
        permission TEXT NOT NULL,
        resource_type TEXT NOT NULL,
        zone_id TEXT NOT NULL,
        bitmap BLOB NOT NULL,
        revision_bucket INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (subject_type, subject_id, permission, resource_type, zone_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tiger_rebuild_queue (
        queue_id INTEGER PRIMARY KEY AUTOINCREMENT,
        subject_type TEXT NOT NULL,
        subject_id TEXT NOT NULL,
        permission TEXT NOT NULL,
        resource_type TEXT NOT NULL,
        zone_id TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 100,
        enqueued_at INTEGER NOT NULL,
        processed_at INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tiger_queue_pending
         ON tiger_rebuild_queue (processed_at, priority, queue_id)",
    // Persisted namespace views let a reconnecting agent skip a full
    // ReBAC-derived rebuild of its mount list.
    r#"
    CREATE TABLE IF NOT EXISTS persistent_namespace_views (
        subject_type TEXT NOT NULL,
        subject_id TEXT NOT NULL,
        zone_id TEXT NOT NULL,
        mount_paths TEXT NOT NULL,
        grants_hash TEXT NOT NULL,
        revision_bucket INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (subject_type, subject_id, zone_id)
    )
    "#,
    // Virtual-path metadata. file_paths carries routing, file_metadata the
    // live content row, version_history the append-only version chain.
    r#"
    CREATE TABLE IF NOT EXISTS file_paths (
        path TEXT PRIMARY KEY,
        zone_id TEXT NOT NULL,
        backend_name TEXT NOT NULL,
        physical_path TEXT NOT NULL,
        is_directory INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_file_paths_zone ON file_paths (zone_id)",
    r#"
    CREATE TABLE IF NOT EXISTS file_metadata (
        path TEXT PRIMARY KEY,
        size INTEGER NOT NULL,
        etag TEXT,
        version INTEGER NOT NULL DEFAULT 1,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS version_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL,
        version INTEGER NOT NULL,
        etag TEXT,
        size INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_version_history_path
         ON version_history (path, version)",
];

/// Create every table and index the core needs.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::debug!("Schema migration complete ({} statements)", STATEMENTS.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Database;

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        migrate(db.pool()).await.unwrap();
        migrate(db.pool()).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rebac_tuples")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_tuple_unique_constraint() {
        let db = Database::in_memory().await.unwrap();
        migrate(db.pool()).await.unwrap();

        let insert = r#"
            INSERT INTO rebac_tuples
                (tuple_id, zone_id, subject_type, subject_id, relation,
                 object_type, object_id, tenant_id, subject_tenant_id,
                 object_tenant_id, created_at)
            VALUES (?1, 'z', 'user', 'alice', 'viewer', 'file', '/f', 't', 't', 't', 0)
        "#;
        sqlx::query(insert).bind("id-1").execute(db.pool()).await.unwrap();
        let dup = sqlx::query(insert).bind("id-2").execute(db.pool()).await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn test_resource_map_autoincrement() {
        let db = Database::in_memory().await.unwrap();
        migrate(db.pool()).await.unwrap();

        sqlx::query(
            "INSERT INTO tiger_resource_map (resource_type, resource_id, created_at)
             VALUES ('file', '/a', 0)",
        )
        .execute(db.pool())
        .await
        .unwrap();
        let id: i64 = sqlx::query_scalar(
            "SELECT resource_int_id FROM tiger_resource_map WHERE resource_id = '/a'",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert!(id > 0);
    }
}
