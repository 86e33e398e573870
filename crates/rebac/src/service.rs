//! Permission service: the in-process decision and write API.
//!
//! Composes the tuple store, closure, evaluator, tiger cache, and
//! coordinator into the single surface callers use. Every mutation funnels
//! through here so the coordinator sees it.

use crate::closure::{GroupClosure, DEFAULT_MAX_DEPTH};
use crate::coordinator::{CacheCoordinator, CoordinatorStats};
use crate::engine::PolicyEngine;
use crate::error::{RebacError, Result};
use crate::graph::ZoneGraphCache;
use crate::namespace::{MountPoint, NamespaceView, NamespaceViewStore};
use crate::resource_map::ResourceIdMap;
use crate::tiger::{TigerCache, TigerConfig};
use crate::tuple::{TupleFilter, TupleRow, TupleStore, WriteTupleRequest};
use chrono::{DateTime, Utc};
use nexus_cache::{
    BitmapCompletenessCache, BoundaryCache, CheckResultCache, DirVisibilityCache, IteratorCache,
};
use nexus_models::{
    is_cross_tenant_allowed, ConsistencyMode, EntityRef, Permission,
    CROSS_TENANT_ALLOWED_RELATIONS,
};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub max_depth: u32,
    pub l1_capacity: usize,
    pub l1_ttl: Duration,
    pub tiger: TigerConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            l1_capacity: 100_000,
            l1_ttl: Duration::from_secs(5),
            tiger: TigerConfig::default(),
        }
    }
}

pub struct PermissionService {
    tuples: Arc<TupleStore>,
    closure: Arc<GroupClosure>,
    tiger: Arc<TigerCache>,
    iterator: Arc<IteratorCache>,
    engine: PolicyEngine,
    coordinator: CacheCoordinator,
    views: NamespaceViewStore,
}

impl PermissionService {
    pub fn new(pool: SqlitePool, config: ServiceConfig) -> Self {
        let tuples = Arc::new(TupleStore::new(pool.clone()));
        let closure = Arc::new(GroupClosure::new(pool.clone(), config.max_depth));
        let resource_map = Arc::new(ResourceIdMap::new(pool.clone()));
        let tiger = Arc::new(TigerCache::new(
            pool.clone(),
            Arc::clone(&resource_map),
            config.tiger.clone(),
        ));
        let zone_graphs = Arc::new(ZoneGraphCache::new());
        let l1 = Arc::new(CheckResultCache::new(config.l1_capacity, config.l1_ttl));
        let boundary = Arc::new(BoundaryCache::default());
        let visibility = Arc::new(DirVisibilityCache::default());
        let iterator = Arc::new(IteratorCache::default());
        let completeness = Arc::new(BitmapCompletenessCache::default());

        let engine = PolicyEngine::new(
            Arc::clone(&tuples),
            Arc::clone(&closure),
            Arc::clone(&resource_map),
            Arc::clone(&tiger),
            Arc::clone(&zone_graphs),
            Arc::clone(&l1),
            Arc::clone(&boundary),
            Arc::clone(&visibility),
            Arc::clone(&completeness),
        );
        let coordinator = CacheCoordinator::new(
            Arc::clone(&tuples),
            Arc::clone(&closure),
            Arc::clone(&resource_map),
            Arc::clone(&tiger),
            zone_graphs,
            l1,
            boundary,
            visibility,
            Arc::clone(&iterator),
            completeness,
        );
        let views = NamespaceViewStore::new(pool);

        Self {
            tuples,
            closure,
            tiger,
            iterator,
            engine,
            coordinator,
            views,
        }
    }

    pub fn with_defaults(pool: SqlitePool) -> Self {
        Self::new(pool, ServiceConfig::default())
    }

    pub fn engine(&self) -> &PolicyEngine {
        &self.engine
    }

    pub fn tuples(&self) -> &TupleStore {
        &self.tuples
    }

    pub fn coordinator_stats(&self) -> CoordinatorStats {
        self.coordinator.stats()
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Write a tuple and drive the cache fan-out.
    pub async fn write(&self, request: &WriteTupleRequest) -> Result<Uuid> {
        let tuple_id = self.tuples.write(request).await?;
        self.coordinator
            .tuple_written(
                &request.zone_id,
                &request.subject,
                &request.relation,
                &request.object,
                &request.tenant_id,
            )
            .await?;
        Ok(tuple_id)
    }

    pub async fn write_batch(&self, requests: &[WriteTupleRequest]) -> Result<Vec<Uuid>> {
        let ids = self.tuples.write_batch(requests).await?;
        for request in requests {
            self.coordinator
                .tuple_written(
                    &request.zone_id,
                    &request.subject,
                    &request.relation,
                    &request.object,
                    &request.tenant_id,
                )
                .await?;
        }
        Ok(ids)
    }

    pub async fn delete(&self, tuple_id: Uuid) -> Result<bool> {
        let Some(row) = self.tuples.get(tuple_id).await? else {
            return Ok(false);
        };
        let deleted = self.tuples.delete(tuple_id).await?;
        if deleted {
            self.coordinator
                .tuple_deleted(&row.zone_id, &row.subject(), &row.relation, &row.object())
                .await?;
        }
        Ok(deleted)
    }

    /// Delete by tuple identity rather than id.
    pub async fn revoke(
        &self,
        subject: &EntityRef,
        relation: &str,
        object: &EntityRef,
        zone_id: &str,
    ) -> Result<bool> {
        match self.tuples.find_tuple_id(subject, relation, object, zone_id).await? {
            Some(tuple_id) => self.delete(tuple_id).await,
            None => Ok(false),
        }
    }

    // ------------------------------------------------------------------
    // Decision path
    // ------------------------------------------------------------------

    pub async fn check(
        &self,
        subject: &EntityRef,
        permission: Permission,
        object: &EntityRef,
        zone_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<bool> {
        self.engine.check(subject, permission, object, zone_id, tenant_id).await
    }

    pub async fn check_batch(
        &self,
        subject: &EntityRef,
        permission: Permission,
        objects: &[EntityRef],
        zone_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<HashMap<String, bool>> {
        self.engine.check_batch(subject, permission, objects, zone_id, tenant_id).await
    }

    pub async fn list_accessible(
        &self,
        subject: &EntityRef,
        permission: Permission,
        object_type: &str,
        zone_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<String>> {
        self.engine.list_accessible(subject, permission, object_type, zone_id, limit).await
    }

    pub async fn has_visible_descendant(
        &self,
        subject: &EntityRef,
        zone_id: &str,
        dir_path: &str,
    ) -> Result<bool> {
        self.engine.has_visible_descendant(subject, zone_id, dir_path).await
    }

    /// First page of a stable listing; the remainder parks behind a cursor
    /// that any write in the zone invalidates.
    pub async fn list_accessible_paged(
        &self,
        subject: &EntityRef,
        permission: Permission,
        object_type: &str,
        zone_id: &str,
        page_size: usize,
    ) -> Result<(Vec<String>, Option<Uuid>)> {
        let page_size = page_size.max(1);
        let mut page = self
            .engine
            .list_accessible(subject, permission, object_type, zone_id, None)
            .await?;
        if page.len() <= page_size {
            return Ok((page, None));
        }
        let rest = page.split_off(page_size);
        let cursor = self.iterator.create(zone_id, rest);
        Ok((page, Some(cursor)))
    }

    /// Follow-up page for a cursor from `list_accessible_paged`. `None`
    /// means the cursor expired, drained, or was invalidated by a write;
    /// callers restart the listing.
    pub fn next_page(&self, cursor: Uuid, page_size: usize) -> Option<Vec<String>> {
        self.iterator.next_page(cursor, page_size.max(1))
    }

    // ------------------------------------------------------------------
    // Share lifecycle
    // ------------------------------------------------------------------

    /// Grant a `shared-*` relation, optionally across tenants and with an
    /// expiry. Non-share relations are rejected here; they go through
    /// `write` under normal tenant rules.
    pub async fn share(
        &self,
        grantee: &EntityRef,
        relation: &str,
        object: &EntityRef,
        zone_id: &str,
        object_tenant: &str,
        grantee_tenant: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Uuid> {
        if !is_cross_tenant_allowed(relation) {
            return Err(RebacError::InvalidState(format!(
                "'{}' is not a share relation",
                relation
            )));
        }
        let mut request = WriteTupleRequest::new(
            grantee.clone(),
            relation,
            object.clone(),
            zone_id,
            object_tenant,
        )
        .with_subject_tenant(grantee_tenant)
        .with_object_tenant(object_tenant);
        request.expires_at = expires_at;
        self.write(&request).await
    }

    pub async fn revoke_share(
        &self,
        grantee: &EntityRef,
        relation: &str,
        object: &EntityRef,
        zone_id: &str,
    ) -> Result<bool> {
        self.revoke(grantee, relation, object, zone_id).await
    }

    /// Shares granted on objects owned by `object_tenant`.
    pub async fn list_outgoing_shares(
        &self,
        object_tenant: &str,
        zone_id: &str,
    ) -> Result<Vec<TupleRow>> {
        let mut shares = Vec::new();
        for relation in CROSS_TENANT_ALLOWED_RELATIONS {
            let filter = TupleFilter {
                zone_id: Some(zone_id.to_string()),
                relation: Some(relation.to_string()),
                ..Default::default()
            };
            shares.extend(
                self.tuples
                    .query(&filter)
                    .await?
                    .into_iter()
                    .filter(|t| t.object_tenant_id == object_tenant),
            );
        }
        Ok(shares)
    }

    /// Shares visible to a grantee subject.
    pub async fn list_incoming_shares(
        &self,
        grantee: &EntityRef,
        zone_id: &str,
    ) -> Result<Vec<TupleRow>> {
        let mut shares = Vec::new();
        for relation in CROSS_TENANT_ALLOWED_RELATIONS {
            let filter = TupleFilter {
                zone_id: Some(zone_id.to_string()),
                subject_type: Some(grantee.entity_type.clone()),
                subject_id: Some(grantee.entity_id.clone()),
                relation: Some(relation.to_string()),
                ..Default::default()
            };
            shares.extend(self.tuples.query(&filter).await?);
        }
        Ok(shares)
    }

    // ------------------------------------------------------------------
    // Zones & namespace views
    // ------------------------------------------------------------------

    pub async fn set_zone_consistency(&self, zone_id: &str, mode: ConsistencyMode) -> Result<()> {
        self.tuples.set_consistency_mode(zone_id, mode).await
    }

    pub async fn zone_revision(&self, zone_id: &str) -> Result<i64> {
        self.tuples.get_zone_revision(zone_id).await
    }

    /// Serve the persisted namespace view when fresh, re-derive otherwise.
    pub async fn namespace_view(
        &self,
        subject: &EntityRef,
        zone_id: &str,
        mounts: &[MountPoint],
    ) -> Result<NamespaceView> {
        let revision = self.tuples.get_zone_revision(zone_id).await?;
        let bucket = self.tiger.revision_bucket(revision);
        if let Some(view) = self.views.load_if_fresh(subject, zone_id, bucket).await? {
            return Ok(view);
        }
        self.views.derive(&self.engine, subject, zone_id, mounts, bucket).await
    }

    // ------------------------------------------------------------------
    // Background maintenance
    // ------------------------------------------------------------------

    /// Spawn the tiger rebuild worker; stop it through the token.
    pub fn start_rebuilder(&self, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        self.tiger.spawn_rebuilder(Arc::clone(&self.tuples), Arc::clone(&self.closure), token)
    }

    /// Run the rebuild queue to empty on the caller's task. The EC-mode
    /// convergence point for tests and shutdown.
    pub async fn drain_rebuild_queue(&self) -> Result<u64> {
        let mut processed = 0;
        while self.tiger.process_next(&self.tuples, &self.closure).await? {
            processed += 1;
        }
        Ok(processed)
    }
}
