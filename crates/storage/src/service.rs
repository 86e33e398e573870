//! File service: the read/write control flow over router, permissions,
//! metadata, and CAS.
//!
//! A read resolves the path, asks the permission engine, fetches the
//! metadata row, and streams the blob. A write hashes content into the CAS,
//! upserts metadata (each version holds one blob reference), and on create
//! writes the `direct_owner` tuple, which is what drives the coordinator's
//! cache fan-out. Deny is surfaced as `PermissionDenied`; a decision-path
//! storage failure propagates as an error, never as deny.

use crate::cas::CasStore;
use crate::error::{Result, StorageError};
use crate::metadata::{FileMetadata, MetadataStore, VersionRecord};
use crate::router::PathRouter;
use nexus_models::{normalize_path, EntityRef, Permission};
use nexus_rebac::{PermissionService, WriteTupleRequest};
use std::sync::Arc;

/// Per-request principal and scope.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub subject: EntityRef,
    pub zone_id: String,
    pub tenant_id: String,
}

impl RequestContext {
    pub fn new(subject: EntityRef, zone_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            subject,
            zone_id: zone_id.into(),
            tenant_id: tenant_id.into(),
        }
    }
}

pub struct FileService {
    router: PathRouter,
    metadata: MetadataStore,
    cas: Arc<CasStore>,
    permissions: Arc<PermissionService>,
}

impl FileService {
    pub fn new(
        router: PathRouter,
        metadata: MetadataStore,
        cas: Arc<CasStore>,
        permissions: Arc<PermissionService>,
    ) -> Self {
        Self {
            router,
            metadata,
            cas,
            permissions,
        }
    }

    pub fn permissions(&self) -> &Arc<PermissionService> {
        &self.permissions
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn cas(&self) -> &Arc<CasStore> {
        &self.cas
    }

    /// Write content to a virtual path.
    pub async fn write(&self, ctx: &RequestContext, path: &str, bytes: &[u8]) -> Result<FileMetadata> {
        let path = normalize_path(path);
        let resolved = self.router.resolve_for_write(&path)?;

        if let Some(existing) = self.metadata.get(&path).await? {
            if existing.is_directory {
                return Err(StorageError::InvalidState(format!("{} is a directory", path)));
            }
        }

        self.require(ctx, Permission::Write, &path).await?;

        let (hash, _is_new) = self.cas.put(bytes, None).await?;
        let outcome = self
            .metadata
            .upsert_file(
                &path,
                &ctx.zone_id,
                &resolved.backend_name,
                &resolved.physical_path,
                bytes.len() as i64,
                &hash,
            )
            .await?;

        if outcome.created {
            self.grant_owner(ctx, &path).await?;
        }

        tracing::info!(
            "Wrote {} ({} bytes, version {}, etag {})",
            path,
            bytes.len(),
            outcome.metadata.version,
            hash
        );
        Ok(outcome.metadata)
    }

    /// Read the live content of a virtual path.
    pub async fn read(&self, ctx: &RequestContext, path: &str) -> Result<Vec<u8>> {
        let path = normalize_path(path);
        self.router.resolve(&path)?;
        self.require(ctx, Permission::Read, &path).await?;

        let metadata = self
            .metadata
            .get(&path)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("path {}", path)))?;
        if metadata.is_directory {
            return Err(StorageError::InvalidState(format!("{} is a directory", path)));
        }
        let etag = metadata
            .etag
            .ok_or_else(|| StorageError::InvalidState(format!("{} has no content", path)))?;

        match self.cas.read(&etag, false).await {
            Ok(bytes) => Ok(bytes),
            // Live metadata pointing at a missing blob is corruption, not a
            // benign not-found.
            Err(StorageError::NotFound(_)) => Err(StorageError::Corruption(format!(
                "path {} references missing blob {}",
                path, etag
            ))),
            Err(e) => Err(e),
        }
    }

    /// Delete a path, releasing every version's blob reference.
    pub async fn delete(&self, ctx: &RequestContext, path: &str) -> Result<bool> {
        let path = normalize_path(path);
        self.router.resolve_for_write(&path)?;
        self.require(ctx, Permission::Write, &path).await?;

        let Some(etags) = self.metadata.delete(&path).await? else {
            return Ok(false);
        };
        for etag in etags {
            self.cas.release(&etag).await?;
        }
        tracing::info!("Deleted {}", path);
        Ok(true)
    }

    /// Create a directory placeholder (sparse index entry).
    pub async fn mkdir(&self, ctx: &RequestContext, path: &str) -> Result<()> {
        let path = normalize_path(path);
        let resolved = self.router.resolve_for_write(&path)?;
        self.require(ctx, Permission::Write, &path).await?;

        self.metadata.mkdir(&path, &ctx.zone_id, &resolved.backend_name).await?;
        self.grant_owner(ctx, &path).await?;
        Ok(())
    }

    /// List the entries of a directory the subject can see: files are
    /// batch-filtered through the bitmap, sub-directories are pruned unless
    /// something under them is visible.
    pub async fn list(&self, ctx: &RequestContext, dir_path: &str) -> Result<Vec<String>> {
        let dir_path = normalize_path(dir_path);
        self.router.resolve(&dir_path)?;

        let entries = self.metadata.list_dir(&dir_path).await?;
        let (dirs, files): (Vec<_>, Vec<_>) = entries.into_iter().partition(|e| e.is_directory);

        let file_objects: Vec<EntityRef> =
            files.iter().map(|f| EntityRef::file(f.path.clone())).collect();
        let decisions = self
            .permissions
            .check_batch(
                &ctx.subject,
                Permission::Read,
                &file_objects,
                &ctx.zone_id,
                Some(ctx.tenant_id.as_str()),
            )
            .await?;

        let mut visible = Vec::new();
        for file in &files {
            if decisions.get(&file.path).copied().unwrap_or(false) {
                visible.push(file.path.clone());
            }
        }
        for dir in &dirs {
            if self
                .permissions
                .has_visible_descendant(&ctx.subject, &ctx.zone_id, &dir.path)
                .await?
                || self
                    .permissions
                    .check(
                        &ctx.subject,
                        Permission::Read,
                        &EntityRef::file(dir.path.clone()),
                        &ctx.zone_id,
                        Some(ctx.tenant_id.as_str()),
                    )
                    .await?
            {
                visible.push(dir.path.clone());
            }
        }
        visible.sort();
        Ok(visible)
    }

    /// Restore a prior version as the new current version.
    pub async fn rollback(&self, ctx: &RequestContext, path: &str, version: i64) -> Result<FileMetadata> {
        let path = normalize_path(path);
        self.router.resolve_for_write(&path)?;
        self.require(ctx, Permission::Write, &path).await?;

        let outcome = self.metadata.rollback(&path, version).await?;
        let etag = outcome.metadata.etag.clone().ok_or_else(|| {
            StorageError::InvalidState(format!("rollback of {} produced no content", path))
        })?;
        // The new version row holds its own blob reference.
        match self.cas.add_ref(&etag).await {
            Ok(_) => {}
            Err(StorageError::NotFound(_)) => {
                return Err(StorageError::Corruption(format!(
                    "version {} of {} references missing blob {}",
                    version, path, etag
                )));
            }
            Err(e) => return Err(e),
        }
        Ok(outcome.metadata)
    }

    pub async fn history(&self, ctx: &RequestContext, path: &str) -> Result<Vec<VersionRecord>> {
        let path = normalize_path(path);
        self.require(ctx, Permission::Read, &path).await?;
        self.metadata.history(&path).await
    }

    /// Garbage-collect old versions of a path, keeping the newest
    /// `keep_last`, and release their blob references.
    pub async fn prune_versions(&self, ctx: &RequestContext, path: &str, keep_last: i64) -> Result<u64> {
        let path = normalize_path(path);
        self.require(ctx, Permission::Admin, &path).await?;

        let pruned = self.metadata.prune_versions(&path, keep_last).await?;
        let mut released = 0;
        for etag in pruned {
            self.cas.release(&etag).await?;
            released += 1;
        }
        Ok(released)
    }

    /// Shutdown / periodic GC hook: metadata pointing at missing blobs.
    pub async fn verify_integrity(&self) -> Result<Vec<String>> {
        self.metadata.verify_integrity(&self.cas).await
    }

    async fn require(&self, ctx: &RequestContext, permission: Permission, path: &str) -> Result<()> {
        let allowed = self
            .permissions
            .check(
                &ctx.subject,
                permission,
                &EntityRef::file(path.to_string()),
                &ctx.zone_id,
                Some(ctx.tenant_id.as_str()),
            )
            .await?;
        if !allowed {
            return Err(StorageError::PermissionDenied(format!(
                "{} may not {} {}",
                ctx.subject, permission, path
            )));
        }
        Ok(())
    }

    async fn grant_owner(&self, ctx: &RequestContext, path: &str) -> Result<()> {
        self.permissions
            .write(&WriteTupleRequest::new(
                ctx.subject.clone(),
                "direct_owner",
                EntityRef::file(path.to_string()),
                ctx.zone_id.clone(),
                ctx.tenant_id.clone(),
            ))
            .await?;
        Ok(())
    }
}
