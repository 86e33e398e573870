use crate::error::{RebacError, Result};
use chrono::{DateTime, Utc};
use nexus_models::{is_cross_tenant_allowed, ConsistencyMode, EntityRef};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

/// An authorization tuple as stored. Immutable once written; an update is a
/// delete followed by an insert.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TupleRow {
    pub tuple_id: String,
    pub zone_id: String,
    pub subject_type: String,
    pub subject_id: String,
    pub relation: String,
    pub object_type: String,
    pub object_id: String,
    pub tenant_id: String,
    pub subject_tenant_id: String,
    pub object_tenant_id: String,
    pub expires_at: Option<i64>,
    pub created_at: i64,
}

impl TupleRow {
    pub fn subject(&self) -> EntityRef {
        EntityRef::new(self.subject_type.clone(), self.subject_id.clone())
    }

    pub fn object(&self) -> EntityRef {
        EntityRef::new(self.object_type.clone(), self.object_id.clone())
    }

    /// Expired tuples are treated as absent; expiry is never swept, only
    /// filtered at read time.
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.map(|e| e <= now).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteTupleRequest {
    pub subject: EntityRef,
    pub relation: String,
    pub object: EntityRef,
    pub zone_id: String,
    pub tenant_id: String,
    pub subject_tenant_id: Option<String>,
    pub object_tenant_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl WriteTupleRequest {
    pub fn new(
        subject: EntityRef,
        relation: impl Into<String>,
        object: EntityRef,
        zone_id: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            subject,
            relation: relation.into(),
            object,
            zone_id: zone_id.into(),
            tenant_id: tenant_id.into(),
            subject_tenant_id: None,
            object_tenant_id: None,
            expires_at: None,
        }
    }

    pub fn with_subject_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.subject_tenant_id = Some(tenant.into());
        self
    }

    pub fn with_object_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.object_tenant_id = Some(tenant.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    fn subject_tenant(&self) -> &str {
        self.subject_tenant_id.as_deref().unwrap_or(&self.tenant_id)
    }

    fn object_tenant(&self) -> &str {
        self.object_tenant_id.as_deref().unwrap_or(&self.tenant_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TupleFilter {
    pub zone_id: Option<String>,
    pub subject_type: Option<String>,
    pub subject_id: Option<String>,
    pub relation: Option<String>,
    pub object_type: Option<String>,
    pub object_id: Option<String>,
    pub tenant_id: Option<String>,
}

#[derive(Clone)]
pub struct TupleStore {
    pool: SqlitePool,
}

impl TupleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a tuple, bumping the zone revision in the same transaction.
    ///
    /// A conflict on the tuple identity returns the existing id: callers
    /// treat `AlreadyExists` as success. Cross-tenant tuples are rejected
    /// unless the relation is on the allow-list.
    pub async fn write(&self, request: &WriteTupleRequest) -> Result<Uuid> {
        self.validate_tenancy(request)?;

        let mut tx = self.pool.begin().await?;
        let (id, inserted) = Self::insert_in_tx(&mut tx, request).await?;
        if inserted {
            Self::bump_revision_in_tx(&mut tx, &request.zone_id).await?;
        }
        tx.commit().await?;

        if inserted {
            tracing::info!(
                "Created tuple: {} {} {} (zone={})",
                request.subject,
                request.relation,
                request.object,
                request.zone_id
            );
        }
        Ok(id)
    }

    /// Single-transaction batch write; on any failure nothing is committed.
    /// The zone revision is bumped once per distinct zone touched.
    pub async fn write_batch(&self, requests: &[WriteTupleRequest]) -> Result<Vec<Uuid>> {
        for request in requests {
            self.validate_tenancy(request)?;
        }

        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(requests.len());
        let mut touched_zones: Vec<&str> = Vec::new();
        for request in requests {
            let (id, inserted) = Self::insert_in_tx(&mut tx, request).await?;
            ids.push(id);
            if inserted && !touched_zones.contains(&request.zone_id.as_str()) {
                touched_zones.push(&request.zone_id);
            }
        }
        for zone_id in touched_zones {
            Self::bump_revision_in_tx(&mut tx, zone_id).await?;
        }
        tx.commit().await?;
        Ok(ids)
    }

    /// Delete by id. Deleting a missing tuple is a benign `false`.
    pub async fn delete(&self, tuple_id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let zone_id: Option<String> =
            sqlx::query_scalar("SELECT zone_id FROM rebac_tuples WHERE tuple_id = ?1")
                .bind(tuple_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;

        let Some(zone_id) = zone_id else {
            return Ok(false);
        };

        sqlx::query("DELETE FROM rebac_tuples WHERE tuple_id = ?1")
            .bind(tuple_id.to_string())
            .execute(&mut *tx)
            .await?;
        Self::bump_revision_in_tx(&mut tx, &zone_id).await?;
        tx.commit().await?;

        tracing::info!("Deleted tuple {} (zone={})", tuple_id, zone_id);
        Ok(true)
    }

    pub async fn get(&self, tuple_id: Uuid) -> Result<Option<TupleRow>> {
        Ok(sqlx::query_as::<_, TupleRow>(
            "SELECT * FROM rebac_tuples WHERE tuple_id = ?1",
        )
        .bind(tuple_id.to_string())
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Id of the tuple with this exact identity, if present.
    pub async fn find_tuple_id(
        &self,
        subject: &EntityRef,
        relation: &str,
        object: &EntityRef,
        zone_id: &str,
    ) -> Result<Option<Uuid>> {
        let id: Option<String> = sqlx::query_scalar(
            r#"
            SELECT tuple_id FROM rebac_tuples
            WHERE zone_id = ?1
              AND subject_type = ?2 AND subject_id = ?3
              AND relation = ?4
              AND object_type = ?5 AND object_id = ?6
            "#,
        )
        .bind(zone_id)
        .bind(&subject.entity_type)
        .bind(&subject.entity_id)
        .bind(relation)
        .bind(&object.entity_type)
        .bind(&object.entity_id)
        .fetch_optional(&self.pool)
        .await?;

        id.map(|s| {
            Uuid::parse_str(&s).map_err(|e| RebacError::Internal(format!("Bad tuple id: {}", e)))
        })
        .transpose()
    }

    /// Query tuples with optional filters on every axis.
    pub async fn query(&self, filter: &TupleFilter) -> Result<Vec<TupleRow>> {
        let mut sql = String::from("SELECT * FROM rebac_tuples WHERE 1 = 1");
        if filter.zone_id.is_some() {
            sql.push_str(" AND zone_id = ?");
        }
        if filter.subject_type.is_some() {
            sql.push_str(" AND subject_type = ?");
        }
        if filter.subject_id.is_some() {
            sql.push_str(" AND subject_id = ?");
        }
        if filter.relation.is_some() {
            sql.push_str(" AND relation = ?");
        }
        if filter.object_type.is_some() {
            sql.push_str(" AND object_type = ?");
        }
        if filter.object_id.is_some() {
            sql.push_str(" AND object_id = ?");
        }
        if filter.tenant_id.is_some() {
            sql.push_str(" AND tenant_id = ?");
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut q = sqlx::query_as::<_, TupleRow>(&sql);
        if let Some(v) = &filter.zone_id {
            q = q.bind(v);
        }
        if let Some(v) = &filter.subject_type {
            q = q.bind(v);
        }
        if let Some(v) = &filter.subject_id {
            q = q.bind(v);
        }
        if let Some(v) = &filter.relation {
            q = q.bind(v);
        }
        if let Some(v) = &filter.object_type {
            q = q.bind(v);
        }
        if let Some(v) = &filter.object_id {
            q = q.bind(v);
        }
        if let Some(v) = &filter.tenant_id {
            q = q.bind(v);
        }

        Ok(q.fetch_all(&self.pool).await?)
    }

    /// Zone-local snapshot, used to rebuild in-process graph state.
    pub async fn fetch_zone(&self, zone_id: &str) -> Result<Vec<TupleRow>> {
        Ok(sqlx::query_as::<_, TupleRow>(
            "SELECT * FROM rebac_tuples WHERE zone_id = ?1 ORDER BY created_at",
        )
        .bind(zone_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Authoritative enumeration of object ids of one type that any of the
    /// given subjects holds one of the given relations on. Live tuples only;
    /// tenant isolation applies except for allow-listed relations.
    pub async fn list_objects(
        &self,
        subjects: &[EntityRef],
        relations: &[&str],
        object_type: &str,
        zone_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<String>> {
        if subjects.is_empty() || relations.is_empty() {
            return Ok(Vec::new());
        }

        let subject_clause = std::iter::repeat("(subject_type = ? AND subject_id = ?)")
            .take(subjects.len())
            .collect::<Vec<_>>()
            .join(" OR ");
        let relation_clause = std::iter::repeat("?")
            .take(relations.len())
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!(
            r#"
            SELECT DISTINCT object_id FROM rebac_tuples
            WHERE zone_id = ?
              AND object_type = ?
              AND ({subject_clause})
              AND relation IN ({relation_clause})
              AND (expires_at IS NULL OR expires_at > ?)
              AND (subject_tenant_id = object_tenant_id
                   OR relation IN ('shared-viewer', 'shared-editor', 'shared-owner'))
            ORDER BY object_id
            "#
        );
        if limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut q = sqlx::query(&sql).bind(zone_id).bind(object_type);
        for subject in subjects {
            q = q.bind(&subject.entity_type).bind(&subject.entity_id);
        }
        for relation in relations {
            q = q.bind(*relation);
        }
        q = q.bind(Utc::now().timestamp());
        if let Some(limit) = limit {
            q = q.bind(limit);
        }

        let rows: Vec<SqliteRow> = q.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("object_id")).collect())
    }

    /// Monotonic per-zone write counter; 0 for a zone never written.
    pub async fn get_zone_revision(&self, zone_id: &str) -> Result<i64> {
        let revision: Option<i64> =
            sqlx::query_scalar("SELECT revision FROM zone_revisions WHERE zone_id = ?1")
                .bind(zone_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(revision.unwrap_or(0))
    }

    pub async fn consistency_mode(&self, zone_id: &str) -> Result<ConsistencyMode> {
        let mode: Option<String> =
            sqlx::query_scalar("SELECT consistency_mode FROM zones WHERE zone_id = ?1")
                .bind(zone_id)
                .fetch_optional(&self.pool)
                .await?;
        match mode {
            Some(s) => ConsistencyMode::from_str(&s).map_err(RebacError::InvalidState),
            None => Ok(ConsistencyMode::default()),
        }
    }

    pub async fn set_consistency_mode(&self, zone_id: &str, mode: ConsistencyMode) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO zones (zone_id, consistency_mode, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (zone_id) DO UPDATE SET consistency_mode = excluded.consistency_mode
            "#,
        )
        .bind(zone_id)
        .bind(mode.as_str())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn validate_tenancy(&self, request: &WriteTupleRequest) -> Result<()> {
        if request.subject_tenant() != request.object_tenant()
            && !is_cross_tenant_allowed(&request.relation)
        {
            return Err(RebacError::TenantIsolation(format!(
                "relation '{}' between tenant '{}' and tenant '{}'",
                request.relation,
                request.subject_tenant(),
                request.object_tenant()
            )));
        }
        Ok(())
    }

    async fn insert_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        request: &WriteTupleRequest,
    ) -> Result<(Uuid, bool)> {
        let tuple_id = Uuid::new_v4();
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO rebac_tuples
                (tuple_id, zone_id, subject_type, subject_id, relation,
                 object_type, object_id, tenant_id, subject_tenant_id,
                 object_tenant_id, expires_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(tuple_id.to_string())
        .bind(&request.zone_id)
        .bind(&request.subject.entity_type)
        .bind(&request.subject.entity_id)
        .bind(&request.relation)
        .bind(&request.object.entity_type)
        .bind(&request.object.entity_id)
        .bind(&request.tenant_id)
        .bind(request.subject_tenant())
        .bind(request.object_tenant())
        .bind(request.expires_at.map(|e| e.timestamp()))
        .bind(Utc::now().timestamp())
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 1 {
            return Ok((tuple_id, true));
        }

        // Conflict: the tuple already exists, which callers treat as success.
        let existing: String = sqlx::query_scalar(
            r#"
            SELECT tuple_id FROM rebac_tuples
            WHERE zone_id = ?1
              AND subject_type = ?2 AND subject_id = ?3
              AND relation = ?4
              AND object_type = ?5 AND object_id = ?6
            "#,
        )
        .bind(&request.zone_id)
        .bind(&request.subject.entity_type)
        .bind(&request.subject.entity_id)
        .bind(&request.relation)
        .bind(&request.object.entity_type)
        .bind(&request.object.entity_id)
        .fetch_one(&mut **tx)
        .await?;

        let id = Uuid::parse_str(&existing)
            .map_err(|e| RebacError::Internal(format!("Bad tuple id: {}", e)))?;
        Ok((id, false))
    }

    async fn bump_revision_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        zone_id: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO zone_revisions (zone_id, revision) VALUES (?1, 1)
            ON CONFLICT (zone_id) DO UPDATE SET revision = revision + 1
            "#,
        )
        .bind(zone_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_database::{schema, Database};

    async fn store() -> TupleStore {
        let db = Database::in_memory().await.unwrap();
        schema::migrate(db.pool()).await.unwrap();
        TupleStore::new(db.pool().clone())
    }

    fn viewer_request(subject: &str, object: &str) -> WriteTupleRequest {
        WriteTupleRequest::new(
            EntityRef::user(subject),
            "viewer",
            EntityRef::file(object),
            "z1",
            "acme",
        )
    }

    #[tokio::test]
    async fn test_write_bumps_zone_revision() {
        let store = store().await;
        assert_eq!(store.get_zone_revision("z1").await.unwrap(), 0);

        store.write(&viewer_request("alice", "/doc")).await.unwrap();
        assert_eq!(store.get_zone_revision("z1").await.unwrap(), 1);

        store.write(&viewer_request("bob", "/doc")).await.unwrap();
        assert_eq!(store.get_zone_revision("z1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_write_returns_existing_id() {
        let store = store().await;
        let first = store.write(&viewer_request("alice", "/doc")).await.unwrap();
        let second = store.write(&viewer_request("alice", "/doc")).await.unwrap();
        assert_eq!(first, second);
        // The no-op write does not advance the revision.
        assert_eq!(store.get_zone_revision("z1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_is_benign_on_missing() {
        let store = store().await;
        assert!(!store.delete(Uuid::new_v4()).await.unwrap());

        let id = store.write(&viewer_request("alice", "/doc")).await.unwrap();
        assert!(store.delete(id).await.unwrap());
        assert!(!store.delete(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cross_tenant_requires_allow_listed_relation() {
        let store = store().await;

        let bad = WriteTupleRequest::new(
            EntityRef::user("bob@partner.com"),
            "viewer",
            EntityRef::file("/project/doc.txt"),
            "z1",
            "acme",
        )
        .with_subject_tenant("partner")
        .with_object_tenant("acme");
        match store.write(&bad).await {
            Err(RebacError::TenantIsolation(_)) => {}
            other => panic!("expected TenantIsolation, got {:?}", other.map(|_| ())),
        }

        let good = WriteTupleRequest::new(
            EntityRef::user("bob@partner.com"),
            "shared-viewer",
            EntityRef::file("/project/doc.txt"),
            "z1",
            "acme",
        )
        .with_subject_tenant("partner")
        .with_object_tenant("acme");
        store.write(&good).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_batch_is_atomic() {
        let store = store().await;
        let requests = vec![viewer_request("alice", "/a"), viewer_request("alice", "/b")];
        let ids = store.write_batch(&requests).await.unwrap();
        assert_eq!(ids.len(), 2);
        // One revision bump per zone, not per tuple.
        assert_eq!(store.get_zone_revision("z1").await.unwrap(), 1);

        // A batch containing a tenancy violation writes nothing.
        let mut bad = viewer_request("carol", "/c");
        bad.subject_tenant_id = Some("other".to_string());
        let result = store.write_batch(&[viewer_request("dave", "/d"), bad]).await;
        assert!(result.is_err());
        let filter = TupleFilter {
            subject_id: Some("dave".to_string()),
            ..Default::default()
        };
        assert!(store.query(&filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_objects_filters_expired() {
        let store = store().await;
        store.write(&viewer_request("alice", "/live")).await.unwrap();
        let expired = WriteTupleRequest::new(
            EntityRef::user("alice"),
            "viewer",
            EntityRef::file("/dead"),
            "z1",
            "acme",
        )
        .with_expiry(Utc::now() - chrono::Duration::seconds(5));
        store.write(&expired).await.unwrap();

        let objects = store
            .list_objects(&[EntityRef::user("alice")], &["viewer"], "file", "z1", None)
            .await
            .unwrap();
        assert_eq!(objects, vec!["/live".to_string()]);
    }

    #[tokio::test]
    async fn test_query_with_filters() {
        let store = store().await;
        store.write(&viewer_request("alice", "/a")).await.unwrap();
        store.write(&viewer_request("bob", "/a")).await.unwrap();

        let filter = TupleFilter {
            zone_id: Some("z1".to_string()),
            object_id: Some("/a".to_string()),
            ..Default::default()
        };
        assert_eq!(store.query(&filter).await.unwrap().len(), 2);

        let filter = TupleFilter {
            subject_id: Some("alice".to_string()),
            ..Default::default()
        };
        assert_eq!(store.query(&filter).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_zone_snapshot() {
        let store = store().await;
        store.write(&viewer_request("alice", "/a")).await.unwrap();
        store.write(&viewer_request("bob", "/b")).await.unwrap();
        let other_zone = WriteTupleRequest::new(
            EntityRef::user("carol"),
            "viewer",
            EntityRef::file("/c"),
            "z2",
            "acme",
        );
        store.write(&other_zone).await.unwrap();

        let snapshot = store.fetch_zone("z1").await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|t| t.zone_id == "z1"));
    }

    #[tokio::test]
    async fn test_consistency_mode_round_trip() {
        let store = store().await;
        assert_eq!(store.consistency_mode("z1").await.unwrap(), ConsistencyMode::Eventual);
        store.set_consistency_mode("z1", ConsistencyMode::Strong).await.unwrap();
        assert_eq!(store.consistency_mode("z1").await.unwrap(), ConsistencyMode::Strong);
    }
}
