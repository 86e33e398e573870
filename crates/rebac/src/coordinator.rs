//! Cache coordinator: the single entry point for cache coherence.
//!
//! Every tuple write or delete flows through here after the store commits
//! (the zone revision bump rides the store's own transaction). The
//! coordinator fans targeted invalidations out to the L1, boundary,
//! visibility, iterator, and completeness layers, patches or re-queues the
//! tiger bitmaps, and cascades through the group closure when the changed
//! relation is a membership edge. Double invalidation is harmless; a missed
//! invalidation is a correctness bug.

use crate::closure::GroupClosure;
use crate::error::Result;
use crate::graph::ZoneGraphCache;
use crate::resource_map::ResourceIdMap;
use crate::tiger::TigerCache;
use crate::tuple::TupleStore;
use nexus_cache::{
    BitmapCompletenessCache, BoundaryCache, CheckResultCache, DirVisibilityCache, IteratorCache,
};
use nexus_models::{implied_permissions, is_membership_relation, ConsistencyMode, EntityRef};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default, Clone)]
pub struct CoordinatorStats {
    pub total_invalidations: u64,
    pub zone_graph_invalidations: u64,
    pub l1_invalidations: u64,
    pub boundary_invalidations: u64,
    pub visibility_invalidations: u64,
    pub iterator_invalidations: u64,
    pub bitmap_updates: u64,
    pub closure_cascades: u64,
}

pub struct CacheCoordinator {
    tuples: Arc<TupleStore>,
    closure: Arc<GroupClosure>,
    resource_map: Arc<ResourceIdMap>,
    tiger: Arc<TigerCache>,
    zone_graphs: Arc<ZoneGraphCache>,
    l1: Arc<CheckResultCache>,
    boundary: Arc<BoundaryCache>,
    visibility: Arc<DirVisibilityCache>,
    iterator: Arc<IteratorCache>,
    completeness: Arc<BitmapCompletenessCache>,

    total_invalidations: AtomicU64,
    zone_graph_invalidations: AtomicU64,
    l1_invalidations: AtomicU64,
    boundary_invalidations: AtomicU64,
    visibility_invalidations: AtomicU64,
    iterator_invalidations: AtomicU64,
    bitmap_updates: AtomicU64,
    closure_cascades: AtomicU64,
}

impl CacheCoordinator {
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
        iterator: Arc<IteratorCache>,
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
            iterator,
            completeness,
            total_invalidations: AtomicU64::new(0),
            zone_graph_invalidations: AtomicU64::new(0),
            l1_invalidations: AtomicU64::new(0),
            boundary_invalidations: AtomicU64::new(0),
            visibility_invalidations: AtomicU64::new(0),
            iterator_invalidations: AtomicU64::new(0),
            bitmap_updates: AtomicU64::new(0),
            closure_cascades: AtomicU64::new(0),
        }
    }

    /// Invalidate after a tuple insert. For membership edges this also
    /// updates the closure and repeats the fan-out for every subject that
    /// became transitively reachable.
    pub async fn tuple_written(
        &self,
        zone_id: &str,
        subject: &EntityRef,
        relation: &str,
        object: &EntityRef,
        tenant_id: &str,
    ) -> Result<()> {
        if is_membership_relation(relation) && object.entity_type == "group" {
            self.closure.apply_membership_write(subject, object, tenant_id).await?;
            self.closure_cascades.fetch_add(1, Ordering::Relaxed);
            self.cascade_membership_change(zone_id, subject, relation, object).await?;
            return Ok(());
        }

        self.fan_out_with_members(zone_id, subject, relation, object, true).await
    }

    /// Invalidate after a tuple delete. Membership deletes recompute the
    /// closure subtree first computing the affected set from the rows about
    /// to be dropped.
    pub async fn tuple_deleted(
        &self,
        zone_id: &str,
        subject: &EntityRef,
        relation: &str,
        object: &EntityRef,
    ) -> Result<()> {
        if is_membership_relation(relation) && object.entity_type == "group" {
            // Affected set while the old closure rows still exist.
            let mut affected = self.closure.transitive_members_of(subject).await?;
            affected.push(subject.clone());

            self.closure.apply_membership_delete(subject, object).await?;
            self.closure_cascades.fetch_add(1, Ordering::Relaxed);

            for member in &affected {
                self.fan_out(zone_id, member, relation, object, false).await?;
                self.invalidate_subject_everywhere(zone_id, member).await?;
            }
            return Ok(());
        }

        self.fan_out_with_members(zone_id, subject, relation, object, false).await
    }

    /// Nuclear option; prefer the targeted paths above.
    pub async fn invalidate_all(&self, zone_id: Option<&str>) -> Result<()> {
        self.l1.clear();
        self.boundary.clear();
        self.visibility.clear();
        self.zone_graphs.invalidate(zone_id);
        match zone_id {
            Some(zone) => {
                self.iterator.invalidate_zone(zone);
                self.completeness.invalidate_zone(zone);
                self.tiger.invalidate(None, Some(zone)).await?;
            }
            None => {
                self.iterator.clear();
                self.completeness.clear();
                self.tiger.invalidate(None, None).await?;
            }
        }
        self.total_invalidations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            total_invalidations: self.total_invalidations.load(Ordering::Relaxed),
            zone_graph_invalidations: self.zone_graph_invalidations.load(Ordering::Relaxed),
            l1_invalidations: self.l1_invalidations.load(Ordering::Relaxed),
            boundary_invalidations: self.boundary_invalidations.load(Ordering::Relaxed),
            visibility_invalidations: self.visibility_invalidations.load(Ordering::Relaxed),
            iterator_invalidations: self.iterator_invalidations.load(Ordering::Relaxed),
            bitmap_updates: self.bitmap_updates.load(Ordering::Relaxed),
            closure_cascades: self.closure_cascades.load(Ordering::Relaxed),
        }
    }

    /// Fan out for the tuple's subject and, when that subject is a group,
    /// for every transitive member: their memoized decisions and bitmaps
    /// all derive from the group's grant.
    async fn fan_out_with_members(
        &self,
        zone_id: &str,
        subject: &EntityRef,
        relation: &str,
        object: &EntityRef,
        added: bool,
    ) -> Result<()> {
        self.fan_out(zone_id, subject, relation, object, added).await?;
        if subject.entity_type == "group" {
            for member in self.closure.transitive_members_of(subject).await? {
                self.fan_out(zone_id, &member, relation, object, added).await?;
            }
        }
        Ok(())
    }

    /// The ordered invalidation steps for one change and one subject.
    async fn fan_out(
        &self,
        zone_id: &str,
        subject: &EntityRef,
        relation: &str,
        object: &EntityRef,
        added: bool,
    ) -> Result<()> {
        self.total_invalidations.fetch_add(1, Ordering::Relaxed);

        // Zone graph snapshot first: everything downstream re-reads it.
        self.zone_graphs.invalidate(Some(zone_id));
        self.zone_graph_invalidations.fetch_add(1, Ordering::Relaxed);

        // L1: everything this subject or object could have memoized.
        self.l1.invalidate_subject(&subject.entity_type, &subject.entity_id, zone_id);
        self.l1.invalidate_object(&object.entity_type, &object.entity_id, zone_id);
        self.l1_invalidations.fetch_add(1, Ordering::Relaxed);

        let permissions = implied_permissions(relation);

        if object.is_file_like() {
            // Boundary: per permission the changed relation implies.
            for permission in permissions {
                self.boundary.invalidate_permission_change(
                    zone_id,
                    &subject.entity_type,
                    &subject.entity_id,
                    *permission,
                    &object.entity_id,
                );
            }
            self.boundary_invalidations.fetch_add(1, Ordering::Relaxed);

            // Visibility: the object's ancestor directories, all subjects.
            self.visibility.invalidate_for_resource(zone_id, &object.entity_id);
            self.visibility_invalidations.fetch_add(1, Ordering::Relaxed);
        }

        // Pagination cursors for the zone.
        self.iterator.invalidate_zone(zone_id);
        self.iterator_invalidations.fetch_add(1, Ordering::Relaxed);

        // Completeness is recomputed on the next check, never assumed.
        self.completeness.invalidate(&subject.entity_type, &subject.entity_id, zone_id);

        // Bitmap maintenance.
        if object.is_file_like() && !permissions.is_empty() {
            self.update_bitmaps(zone_id, subject, object, permissions, added).await?;
        }

        Ok(())
    }

    /// Fast-path bitmap delta under SC for additions; rebuild queue for
    /// everything else. A failed bitmap touch is logged, not fatal: the
    /// tuple write already succeeded and the queue will repair.
    async fn update_bitmaps(
        &self,
        zone_id: &str,
        subject: &EntityRef,
        object: &EntityRef,
        permissions: &[nexus_models::Permission],
        added: bool,
    ) -> Result<()> {
        let mode = self.tuples.consistency_mode(zone_id).await?;
        let revision = self.tuples.get_zone_revision(zone_id).await?;
        let bucket = self.tiger.revision_bucket(revision);

        for permission in permissions {
            let applied = if added && mode == ConsistencyMode::Strong {
                let int_id =
                    self.resource_map.intern(&object.entity_type, &object.entity_id).await?;
                match self
                    .tiger
                    .add_resource(subject, *permission, &object.entity_type, zone_id, int_id, bucket)
                    .await
                {
                    Ok(applied) => applied,
                    Err(e) => {
                        tracing::warn!("Tiger fast-path update failed: {}", e);
                        false
                    }
                }
            } else {
                false
            };

            if !applied {
                // Removal or miss: authoritative rebuild. Under SC do it
                // inline so the next read observes this write.
                if mode == ConsistencyMode::Strong {
                    self.tiger
                        .rebuild(
                            &self.tuples,
                            &self.closure,
                            subject,
                            *permission,
                            &object.entity_type,
                            zone_id,
                        )
                        .await?;
                } else {
                    self.tiger
                        .enqueue_rebuild(subject, *permission, &object.entity_type, zone_id, 100)
                        .await?;
                }
            }
            self.bitmap_updates.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// After a membership write, every transitive member of the subject (the
    /// subject included) may have gained or lost reach through the group.
    async fn cascade_membership_change(
        &self,
        zone_id: &str,
        subject: &EntityRef,
        relation: &str,
        group: &EntityRef,
    ) -> Result<()> {
        let mut affected = self.closure.transitive_members_of(subject).await?;
        affected.push(subject.clone());

        for member in &affected {
            self.fan_out(zone_id, member, relation, group, true).await?;
            self.invalidate_subject_everywhere(zone_id, member).await?;
        }
        Ok(())
    }

    /// Subject-wide cleanup used by the membership cascade: group changes
    /// can affect any object the group granted, so per-object targeting is
    /// impossible and the subject's derived state drops wholesale.
    async fn invalidate_subject_everywhere(&self, zone_id: &str, member: &EntityRef) -> Result<()> {
        self.l1.invalidate_subject(&member.entity_type, &member.entity_id, zone_id);
        self.visibility.invalidate_subject(zone_id, &member.entity_type, &member.entity_id);
        self.completeness.invalidate(&member.entity_type, &member.entity_id, zone_id);
        self.tiger.invalidate(Some(member), Some(zone_id)).await?;

        // Queue fresh bitmaps for every permission.
        for permission in nexus_models::Permission::ALL {
            self.tiger.enqueue_rebuild(member, permission, "file", zone_id, 50).await?;
        }
        Ok(())
    }
}
