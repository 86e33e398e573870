//! Graph evaluator: the permission decision procedure.
//!
//! A check consults, in order: the L1 result cache, the boundary cache, the
//! tiger bitmap, and finally the tuple store. Deny is a value; a storage
//! failure is an error and is never reported as deny. A bitmap miss or
//! negative is likewise never final: the tuple store is the single source
//! of truth and every cached layer above it only short-circuits positives
//! (or, for the boundary cache, the ancestor traversal).

use crate::closure::GroupClosure;
use crate::error::Result;
use crate::graph::{ZoneGraph, ZoneGraphCache};
use crate::resource_map::ResourceIdMap;
use crate::tiger::TigerCache;
use crate::tuple::{TupleRow, TupleStore};
use chrono::Utc;
use nexus_cache::{
    BitmapCompletenessCache, BoundaryCache, CheckKey, CheckResultCache, DirVisibilityCache,
};
use nexus_models::{
    ancestor_paths, is_cross_tenant_allowed, is_same_or_descendant, relation_spec,
    relations_granting, EntityRef, Permission,
};
use roaring::RoaringTreemap;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct PolicyEngine {
    tuples: Arc<TupleStore>,
    closure: Arc<GroupClosure>,
    resource_map: Arc<ResourceIdMap>,
    tiger: Arc<TigerCache>,
    zone_graphs: Arc<ZoneGraphCache>,
    l1: Arc<CheckResultCache>,
    boundary: Arc<BoundaryCache>,
    visibility: Arc<DirVisibilityCache>,
    completeness: Arc<BitmapCompletenessCache>,
}

impl PolicyEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tuples: Arc<TupleStore>,
        closure: Arc<GroupClosure>,
        resource_map: Arc<ResourceIdMap>,
        tiger: Arc<TigerCache>,
        zone_graphs: Arc<ZoneGraphCache>,
        l1: Arc<CheckResultCache>,
        boundary: Arc<BoundaryCache>,
        visibility: Arc<DirVisibilityCache>,
        completeness: Arc<BitmapCompletenessCache>,
    ) -> Self {
        Self {
            tuples,
            closure,
            resource_map,
            tiger,
            zone_graphs,
            l1,
            boundary,
            visibility,
            completeness,
        }
    }

    /// May `subject` perform `permission` on `object` in `zone_id`?
    pub async fn check(
        &self,
        subject: &EntityRef,
        permission: Permission,
        object: &EntityRef,
        zone_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<bool> {
        let key = CheckKey {
            subject_type: subject.entity_type.clone(),
            subject_id: subject.entity_id.clone(),
            permission,
            object_type: object.entity_type.clone(),
            object_id: object.entity_id.clone(),
            zone_id: zone_id.to_string(),
        };

        if let Some(allowed) = self.l1.get(&key) {
            return Ok(allowed);
        }

        // Boundary probe. A positive hit is final; a negative hit only rules
        // out the ancestor chain, a direct grant may still exist.
        let mut skip_ancestors = false;
        if object.is_file_like() {
            match self.boundary.get_boundary(
                zone_id,
                &subject.entity_type,
                &subject.entity_id,
                permission,
                &object.entity_id,
            ) {
                Some(Some(_)) => {
                    self.l1.insert(key, true);
                    return Ok(true);
                }
                Some(None) => skip_ancestors = true,
                None => {}
            }
        }

        // Bitmap probe: only a positive is trusted, the bitmap may lag.
        if let Some(true) = self
            .tiger
            .check_access(subject, permission, &object.entity_type, &object.entity_id, zone_id)
            .await?
        {
            self.l1.insert(key, true);
            return Ok(true);
        }

        let allowed = self
            .evaluate(subject, permission, object, zone_id, tenant_id, skip_ancestors)
            .await?;
        self.l1.insert(key, allowed);
        Ok(allowed)
    }

    /// Batched check over many objects; bitmap membership answers the bulk,
    /// leftovers fall through to single checks.
    pub async fn check_batch(
        &self,
        subject: &EntityRef,
        permission: Permission,
        objects: &[EntityRef],
        zone_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<HashMap<String, bool>> {
        let mut results = HashMap::with_capacity(objects.len());
        if objects.is_empty() {
            return Ok(results);
        }

        // One bitmap fetch per object type present in the batch.
        let mut bitmaps: HashMap<String, Option<RoaringTreemap>> = HashMap::new();
        for object in objects {
            if !bitmaps.contains_key(&object.entity_type) {
                let bitmap = self
                    .tiger
                    .get_accessible_resources(subject, permission, &object.entity_type, zone_id)
                    .await?;
                bitmaps.insert(object.entity_type.clone(), bitmap);
            }
        }

        let pairs: Vec<(String, String)> = objects
            .iter()
            .map(|o| (o.entity_type.clone(), o.entity_id.clone()))
            .collect();
        let int_ids = self.resource_map.lookup_batch(&pairs).await?;

        for object in objects {
            let pair = (object.entity_type.clone(), object.entity_id.clone());
            let hit = match (bitmaps.get(&object.entity_type), int_ids.get(&pair)) {
                (Some(Some(bitmap)), Some(Some(id))) => bitmap.contains(*id as u64),
                _ => false,
            };
            if hit {
                results.insert(object.entity_id.clone(), true);
            } else {
                // Unmapped or absent: the authoritative path decides.
                let allowed = self.check(subject, permission, object, zone_id, tenant_id).await?;
                results.insert(object.entity_id.clone(), allowed);
            }
        }
        Ok(results)
    }

    /// Every object id of `object_type` the subject can reach. Serves from
    /// the bitmap when its revision bucket is close enough to the zone's
    /// current revision; otherwise enumerates the tuple store and, depending
    /// on the zone's consistency mode, repopulates inline (SC) or queues a
    /// rebuild (EC).
    pub async fn list_accessible(
        &self,
        subject: &EntityRef,
        permission: Permission,
        object_type: &str,
        zone_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<String>> {
        let revision = self.tuples.get_zone_revision(zone_id).await?;
        let current_bucket = self.tiger.revision_bucket(revision);

        if let Some(stored) =
            self.tiger.get_bitmap(subject, permission, object_type, zone_id).await?
        {
            if (current_bucket - stored.revision_bucket).abs() <= 1 {
                let mut out = Vec::new();
                for int_id in stored.bitmap.iter() {
                    if let Some((rtype, rid)) = self.resource_map.resolve(int_id as i64).await? {
                        if rtype == object_type {
                            out.push(rid);
                        }
                    }
                    if limit.map(|l| out.len() >= l).unwrap_or(false) {
                        break;
                    }
                }
                return Ok(out);
            }
        }

        let mut subjects = vec![subject.clone()];
        subjects.extend(self.closure.groups_of(subject).await?);
        let relations = relations_granting(permission);
        let objects = self
            .tuples
            .list_objects(&subjects, &relations, object_type, zone_id, limit.map(|l| l as i64))
            .await?;

        match self.tuples.consistency_mode(zone_id).await? {
            nexus_models::ConsistencyMode::Strong => {
                self.tiger
                    .rebuild(&self.tuples, &self.closure, subject, permission, object_type, zone_id)
                    .await?;
            }
            nexus_models::ConsistencyMode::Eventual => {
                self.tiger
                    .enqueue_rebuild(subject, permission, object_type, zone_id, 100)
                    .await?;
            }
        }

        Ok(objects)
    }

    /// Does the subject see anything at or under `dir_path`? Used to prune
    /// empty directories out of listings. Cached; computed by scanning the
    /// subject's read bitmap, falling back to an authoritative listing when
    /// no bitmap exists yet.
    pub async fn has_visible_descendant(
        &self,
        subject: &EntityRef,
        zone_id: &str,
        dir_path: &str,
    ) -> Result<bool> {
        if let Some(visible) = self.visibility.is_visible(
            zone_id,
            &subject.entity_type,
            &subject.entity_id,
            dir_path,
        ) {
            return Ok(visible);
        }

        let visible = match self
            .tiger
            .get_accessible_resources(subject, Permission::Read, "file", zone_id)
            .await?
        {
            Some(bitmap) => {
                let mut found = false;
                for int_id in bitmap.iter() {
                    if let Some((_, path)) = self.resource_map.resolve(int_id as i64).await? {
                        if is_same_or_descendant(&path, dir_path) {
                            found = true;
                            break;
                        }
                    }
                }
                found
            }
            None => {
                let paths = self
                    .list_accessible(subject, Permission::Read, "file", zone_id, None)
                    .await?;
                paths.iter().any(|p| is_same_or_descendant(p, dir_path))
            }
        };

        self.visibility.set_visible(
            zone_id,
            &subject.entity_type,
            &subject.entity_id,
            dir_path,
            visible,
        );
        Ok(visible)
    }

    /// Full evaluation against the zone graph snapshot: subject expansion,
    /// direct match, ancestor inheritance, zone role.
    async fn evaluate(
        &self,
        subject: &EntityRef,
        permission: Permission,
        object: &EntityRef,
        zone_id: &str,
        tenant_id: Option<&str>,
        skip_ancestors: bool,
    ) -> Result<bool> {
        let now = Utc::now().timestamp();
        let graph = self.zone_graph(zone_id).await?;

        let mut subjects = vec![subject.clone()];
        subjects.extend(self.closure.groups_of(subject).await?);

        // Direct grant on the object itself.
        if graph
            .tuples_for(object)
            .iter()
            .any(|t| subject_matches(&subjects, t) && tuple_grants(t, permission, now, tenant_id, false))
        {
            return Ok(true);
        }

        // Inherited grant on an ancestor directory.
        if object.is_file_like() && !skip_ancestors {
            let complete = self
                .bitmap_is_complete(subject, &subjects, zone_id, now)
                .await?;
            if !complete {
                let mut granting: Option<String> = None;
                for ancestor in ancestor_paths(&object.entity_id) {
                    let ancestor_object =
                        EntityRef::new(object.entity_type.clone(), ancestor.clone());
                    if graph.tuples_for(&ancestor_object).iter().any(|t| {
                        subject_matches(&subjects, t)
                            && tuple_grants(t, permission, now, tenant_id, true)
                    }) {
                        granting = Some(ancestor);
                        break;
                    }
                }
                self.boundary.record_boundary(
                    zone_id,
                    &subject.entity_type,
                    &subject.entity_id,
                    permission,
                    &object.entity_id,
                    granting.clone(),
                );
                if granting.is_some() {
                    return Ok(true);
                }
            }
        }

        // Zone role bypass.
        let zone_object = EntityRef::zone(zone_id);
        for t in graph.tuples_for(&zone_object) {
            if matches!(t.relation.as_str(), "zone-admin" | "zone-owner")
                && subject_matches(&subjects, t)
                && tuple_grants(t, permission, now, tenant_id, false)
            {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Serve the zone's graph snapshot, rebuilding it from the tuple store
    /// when the revision counter has moved past the cached copy.
    async fn zone_graph(&self, zone_id: &str) -> Result<Arc<ZoneGraph>> {
        let revision = self.tuples.get_zone_revision(zone_id).await?;
        if let Some(graph) = self.zone_graphs.get(zone_id) {
            if graph.revision() == revision {
                return Ok(graph);
            }
        }
        let tuples = self.tuples.fetch_zone(zone_id).await?;
        Ok(self.zone_graphs.insert(ZoneGraph::from_tuples(zone_id, revision, tuples)))
    }

    /// Completeness shortcut: a subject whose expanded set holds no
    /// inheritable grant anywhere in the zone cannot gain anything from the
    /// ancestor walk. The flag is recomputed on demand, never assumed.
    async fn bitmap_is_complete(
        &self,
        subject: &EntityRef,
        subjects: &[EntityRef],
        zone_id: &str,
        now: i64,
    ) -> Result<bool> {
        if self
            .completeness
            .is_complete(&subject.entity_type, &subject.entity_id, zone_id)
        {
            return Ok(true);
        }

        let inheritable: Vec<&str> = nexus_models::RELATION_REGISTRY
            .iter()
            .filter(|(_, spec)| spec.inheritable)
            .map(|(name, _)| *name)
            .collect();
        let subject_clause = std::iter::repeat("(subject_type = ? AND subject_id = ?)")
            .take(subjects.len())
            .collect::<Vec<_>>()
            .join(" OR ");
        let relation_clause = std::iter::repeat("?")
            .take(inheritable.len())
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"
            SELECT COUNT(*) FROM rebac_tuples
            WHERE zone_id = ?
              AND object_type IN ('file', 'directory', 'memory', 'resource')
              AND ({subject_clause})
              AND relation IN ({relation_clause})
              AND (expires_at IS NULL OR expires_at > ?)
            "#
        );
        let mut q = sqlx::query_scalar::<_, i64>(&sql).bind(zone_id);
        for s in subjects {
            q = q.bind(&s.entity_type).bind(&s.entity_id);
        }
        for r in &inheritable {
            q = q.bind(*r);
        }
        q = q.bind(now);
        let count: i64 = q.fetch_one(self.tuples.pool()).await?;

        if count == 0 {
            self.completeness
                .mark_complete(&subject.entity_type, &subject.entity_id, zone_id);
            return Ok(true);
        }
        Ok(false)
    }
}

/// Does the tuple's subject fall inside the expanded subject set?
fn subject_matches(subjects: &[EntityRef], tuple: &TupleRow) -> bool {
    subjects
        .iter()
        .any(|s| s.entity_type == tuple.subject_type && s.entity_id == tuple.subject_id)
}

/// Expiry, tenant, and grant filter for one visited tuple.
fn tuple_grants(
    tuple: &TupleRow,
    permission: Permission,
    now: i64,
    tenant_id: Option<&str>,
    require_inheritable: bool,
) -> bool {
    if tuple.is_expired(now) {
        return false;
    }
    // Cross-tenant tuples only count for allow-listed relations.
    if tuple.subject_tenant_id != tuple.object_tenant_id
        && !is_cross_tenant_allowed(&tuple.relation)
    {
        return false;
    }
    if let Some(tenant) = tenant_id {
        if tuple.tenant_id != tenant
            && tuple.subject_tenant_id != tenant
            && tuple.object_tenant_id != tenant
        {
            return false;
        }
    }
    let Some(spec) = relation_spec(&tuple.relation) else {
        return false;
    };
    if require_inheritable && !spec.inheritable {
        return false;
    }
    spec.grants.contains(&permission)
}
