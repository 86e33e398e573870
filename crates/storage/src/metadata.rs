//! Path metadata: routing rows, live content rows, and version history.
//!
//! Every live file row's `etag` is a CAS hash with `ref_count >= 1`; the
//! file service maintains that invariant on write, delete, and rollback.
//! Directory rows carry no etag and act as a sparse index so listings can
//! include empty or placeholder directories.

use crate::cas::CasStore;
use crate::error::{Result, StorageError};
use chrono::Utc;
use nexus_models::{normalize_path, parent_path};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub path: String,
    pub zone_id: String,
    pub backend_name: String,
    pub physical_path: String,
    pub is_directory: bool,
    pub size: i64,
    pub etag: Option<String>,
    pub version: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct VersionRecord {
    pub version: i64,
    pub etag: Option<String>,
    pub size: i64,
    pub created_at: i64,
}

/// Outcome of an upsert: the new row plus the etag it replaced, which the
/// caller must release from the CAS.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub metadata: FileMetadata,
    pub replaced_etag: Option<String>,
    pub created: bool,
}

#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, path: &str) -> Result<Option<FileMetadata>> {
        let path = normalize_path(path);
        let row: Option<SqliteRow> = sqlx::query(
            r#"
            SELECT p.path, p.zone_id, p.backend_name, p.physical_path, p.is_directory,
                   COALESCE(m.size, 0) AS size, m.etag,
                   COALESCE(m.version, 1) AS version,
                   COALESCE(m.updated_at, p.created_at) AS updated_at
            FROM file_paths p
            LEFT JOIN file_metadata m ON m.path = p.path
            WHERE p.path = ?1
            "#,
        )
        .bind(&path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_metadata))
    }

    /// Create or replace the content row for a path, bumping the version and
    /// appending to the version history in one transaction.
    pub async fn upsert_file(
        &self,
        path: &str,
        zone_id: &str,
        backend_name: &str,
        physical_path: &str,
        size: i64,
        etag: &str,
    ) -> Result<UpsertOutcome> {
        let path = normalize_path(path);
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let existing: Option<SqliteRow> = sqlx::query(
            "SELECT etag, version FROM file_metadata WHERE path = ?1",
        )
        .bind(&path)
        .fetch_optional(&mut *tx)
        .await?;
        let (replaced_etag, version) = match &existing {
            Some(row) => (row.get::<Option<String>, _>("etag"), row.get::<i64, _>("version") + 1),
            None => (None, 1),
        };

        sqlx::query(
            r#"
            INSERT INTO file_paths (path, zone_id, backend_name, physical_path, is_directory, created_at)
            VALUES (?1, ?2, ?3, ?4, 0, ?5)
            ON CONFLICT (path) DO UPDATE SET backend_name = excluded.backend_name,
                                             physical_path = excluded.physical_path
            "#,
        )
        .bind(&path)
        .bind(zone_id)
        .bind(backend_name)
        .bind(physical_path)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO file_metadata (path, size, etag, version, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (path) DO UPDATE SET size = excluded.size,
                                             etag = excluded.etag,
                                             version = excluded.version,
                                             updated_at = excluded.updated_at
            "#,
        )
        .bind(&path)
        .bind(size)
        .bind(etag)
        .bind(version)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO version_history (path, version, etag, size, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&path)
        .bind(version)
        .bind(etag)
        .bind(size)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(UpsertOutcome {
            metadata: FileMetadata {
                path,
                zone_id: zone_id.to_string(),
                backend_name: backend_name.to_string(),
                physical_path: physical_path.to_string(),
                is_directory: false,
                size,
                etag: Some(etag.to_string()),
                version,
                updated_at: now,
            },
            replaced_etag,
            created: existing.is_none(),
        })
    }

    /// Insert a directory placeholder row. Idempotent.
    pub async fn mkdir(&self, path: &str, zone_id: &str, backend_name: &str) -> Result<()> {
        let path = normalize_path(path);
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO file_paths
                (path, zone_id, backend_name, physical_path, is_directory, created_at)
            VALUES (?1, ?2, ?3, ?1, 1, ?4)
            "#,
        )
        .bind(&path)
        .bind(zone_id)
        .bind(backend_name)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove a path's rows, version history included. Returns `None` for an
    /// absent path, otherwise the etags of every version row; each version
    /// holds one CAS reference, so the caller releases each entry once.
    pub async fn delete(&self, path: &str) -> Result<Option<Vec<String>>> {
        let path = normalize_path(path);
        let mut tx = self.pool.begin().await?;
        let existing: Option<SqliteRow> =
            sqlx::query("SELECT path FROM file_paths WHERE path = ?1")
                .bind(&path)
                .fetch_optional(&mut *tx)
                .await?;
        if existing.is_none() {
            return Ok(None);
        }

        let rows: Vec<SqliteRow> =
            sqlx::query("SELECT etag FROM version_history WHERE path = ?1")
                .bind(&path)
                .fetch_all(&mut *tx)
                .await?;
        let etags: Vec<String> =
            rows.into_iter().filter_map(|r| r.get::<Option<String>, _>("etag")).collect();

        sqlx::query("DELETE FROM version_history WHERE path = ?1")
            .bind(&path)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM file_metadata WHERE path = ?1")
            .bind(&path)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM file_paths WHERE path = ?1")
            .bind(&path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(etags))
    }

    /// Drop all but the newest `keep_last` versions of a path, returning the
    /// pruned rows' etags for CAS release. The current version always stays.
    pub async fn prune_versions(&self, path: &str, keep_last: i64) -> Result<Vec<String>> {
        let path = normalize_path(path);
        let keep_last = keep_last.max(1);
        let mut tx = self.pool.begin().await?;

        let rows: Vec<SqliteRow> = sqlx::query(
            r#"
            SELECT version, etag FROM version_history
            WHERE path = ?1
            ORDER BY version DESC
            "#,
        )
        .bind(&path)
        .fetch_all(&mut *tx)
        .await?;

        let mut pruned = Vec::new();
        for row in rows.iter().skip(keep_last as usize) {
            let version: i64 = row.get("version");
            sqlx::query("DELETE FROM version_history WHERE path = ?1 AND version = ?2")
                .bind(&path)
                .bind(version)
                .execute(&mut *tx)
                .await?;
            if let Some(etag) = row.get::<Option<String>, _>("etag") {
                pruned.push(etag);
            }
        }
        tx.commit().await?;
        Ok(pruned)
    }

    /// Direct children of a directory, directories first then files, both
    /// name-ordered.
    pub async fn list_dir(&self, dir_path: &str) -> Result<Vec<FileMetadata>> {
        let dir_path = normalize_path(dir_path);
        let prefix = if dir_path == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir_path)
        };

        let like = format!("{}%", escape_like(&prefix));
        let rows: Vec<SqliteRow> = sqlx::query(
            r#"
            SELECT p.path, p.zone_id, p.backend_name, p.physical_path, p.is_directory,
                   COALESCE(m.size, 0) AS size, m.etag,
                   COALESCE(m.version, 1) AS version,
                   COALESCE(m.updated_at, p.created_at) AS updated_at
            FROM file_paths p
            LEFT JOIN file_metadata m ON m.path = p.path
            WHERE p.path LIKE ?1 ESCAPE '\'
            ORDER BY p.is_directory DESC, p.path
            "#,
        )
        .bind(&like)
        .fetch_all(&self.pool)
        .await?;

        // Keep direct children only; deeper descendants belong to sub-listings.
        Ok(rows
            .into_iter()
            .map(row_to_metadata)
            .filter(|m| {
                parent_path(&m.path).map(|p| p == dir_path).unwrap_or(false)
            })
            .collect())
    }

    pub async fn history(&self, path: &str) -> Result<Vec<VersionRecord>> {
        let path = normalize_path(path);
        let rows: Vec<SqliteRow> = sqlx::query(
            r#"
            SELECT version, etag, size, created_at FROM version_history
            WHERE path = ?1 ORDER BY version
            "#,
        )
        .bind(&path)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| VersionRecord {
                version: r.get("version"),
                etag: r.get("etag"),
                size: r.get("size"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    /// Restore a prior version's content as a new version. Rolling back to
    /// the version that is already current is an invalid transition.
    pub async fn rollback(&self, path: &str, version: i64) -> Result<UpsertOutcome> {
        let path = normalize_path(path);
        let current = self
            .get(&path)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("path {}", path)))?;
        if current.version == version {
            return Err(StorageError::InvalidState(format!(
                "path {} is already at version {}",
                path, version
            )));
        }

        let target: Option<SqliteRow> = sqlx::query(
            "SELECT etag, size FROM version_history WHERE path = ?1 AND version = ?2",
        )
        .bind(&path)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        let target = target.ok_or_else(|| {
            StorageError::NotFound(format!("version {} of {}", version, path))
        })?;
        let etag: Option<String> = target.get("etag");
        let size: i64 = target.get("size");
        let etag = etag.ok_or_else(|| {
            StorageError::InvalidState(format!("version {} of {} has no content", version, path))
        })?;

        self.upsert_file(
            &path,
            &current.zone_id,
            &current.backend_name,
            &current.physical_path,
            size,
            &etag,
        )
        .await
    }

    /// Cross-check live metadata against the CAS: every live etag must have
    /// a backing blob. Returns human-readable findings; an empty list is a
    /// clean bill.
    pub async fn verify_integrity(&self, cas: &CasStore) -> Result<Vec<String>> {
        let rows: Vec<SqliteRow> =
            sqlx::query("SELECT path, etag FROM file_metadata WHERE etag IS NOT NULL")
                .fetch_all(&self.pool)
                .await?;

        let mut findings = Vec::new();
        for row in rows {
            let path: String = row.get("path");
            let etag: String = row.get("etag");
            if !cas.exists(&etag).await {
                findings.push(format!("path {} references missing blob {}", path, etag));
            } else if cas.ref_count(&etag).await? == 0 {
                findings.push(format!("path {} references zero-ref blob {}", path, etag));
            }
        }
        Ok(findings)
    }
}

fn row_to_metadata(row: SqliteRow) -> FileMetadata {
    FileMetadata {
        path: row.get("path"),
        zone_id: row.get("zone_id"),
        backend_name: row.get("backend_name"),
        physical_path: row.get("physical_path"),
        is_directory: row.get::<i64, _>("is_directory") != 0,
        size: row.get("size"),
        etag: row.get("etag"),
        version: row.get("version"),
        updated_at: row.get("updated_at"),
    }
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}
