//! Content-addressable blob store.
//!
//! Blobs live at `<root>/<h[0:2]>/<h[2:4]>/<h>` with a JSON sidecar
//! `<h>.meta` holding the reference count. A blob exists exactly while some
//! metadata row references its hash; `ref_count` is the cardinality of that
//! set. Blob and meta writes go through temp-file + rename; ref-count
//! read-modify-write serializes on a per-hash lock. Transient I/O errors
//! retry with capped exponential backoff.

use crate::error::{Result, StorageError};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CasConfig {
    /// Fsync blob files after write. Meta files always rename atomically;
    /// fsync is the extra durability knob for the payload itself.
    pub fsync: bool,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for CasConfig {
    fn default() -> Self {
        Self {
            fsync: false,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(20),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlobMeta {
    ref_count: u64,
    size: u64,
    #[serde(default)]
    extra: Vec<(String, String)>,
}

pub struct CasStore {
    root: PathBuf,
    config: CasConfig,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CasStore {
    pub fn new(root: impl Into<PathBuf>, config: CasConfig) -> Self {
        Self {
            root: root.into(),
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults(root: impl Into<PathBuf>) -> Self {
        Self::new(root, CasConfig::default())
    }

    /// Content hash: lowercase hex SHA-256. The empty input hashes like any
    /// other content; empty blobs are legitimate.
    pub fn hash_bytes(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// Hash and store in one step.
    pub async fn put(&self, bytes: &[u8], extra: Option<Vec<(String, String)>>) -> Result<(String, bool)> {
        let hash = Self::hash_bytes(bytes);
        let is_new = self.store(&hash, bytes, extra).await?;
        Ok((hash, is_new))
    }

    /// Store bytes under their hash, incrementing the reference count.
    /// Returns whether the blob was newly created.
    pub async fn store(
        &self,
        hash: &str,
        bytes: &[u8],
        extra: Option<Vec<(String, String)>>,
    ) -> Result<bool> {
        let computed = Self::hash_bytes(bytes);
        if computed != hash {
            return Err(StorageError::Corruption(format!(
                "content hashes to {} but was stored as {}",
                computed, hash
            )));
        }

        let lock = self.lock_for(hash);
        let _guard = lock.lock().await;

        let meta_path = self.meta_path(hash);
        if let Some(mut meta) = self.read_meta(&meta_path).await? {
            meta.ref_count += 1;
            if let Some(extra) = extra {
                for pair in extra {
                    if !meta.extra.contains(&pair) {
                        meta.extra.push(pair);
                    }
                }
            }
            self.write_meta(&meta_path, &meta).await?;
            tracing::debug!("Blob {} ref_count -> {}", hash, meta.ref_count);
            return Ok(false);
        }

        let blob_path = self.blob_path(hash);
        if let Some(parent) = blob_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.write_atomic(&blob_path, bytes, self.config.fsync).await?;
        let meta = BlobMeta {
            ref_count: 1,
            size: bytes.len() as u64,
            extra: extra.unwrap_or_default(),
        };
        self.write_meta(&meta_path, &meta).await?;
        tracing::debug!("Blob {} created ({} bytes)", hash, bytes.len());
        Ok(true)
    }

    /// Read a blob; `verify` recomputes the hash and fails on mismatch.
    pub async fn read(&self, hash: &str, verify: bool) -> Result<Vec<u8>> {
        let blob_path = self.blob_path(hash);
        let bytes = match tokio::fs::read(&blob_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(format!("blob {}", hash)));
            }
            Err(e) => return Err(e.into()),
        };
        if verify {
            let computed = Self::hash_bytes(&bytes);
            if computed != hash {
                return Err(StorageError::Corruption(format!(
                    "blob {} reads back as {}",
                    hash, computed
                )));
            }
        }
        Ok(bytes)
    }

    pub async fn exists(&self, hash: &str) -> bool {
        tokio::fs::try_exists(self.blob_path(hash)).await.unwrap_or(false)
    }

    /// Current reference count; 0 for unknown hashes.
    pub async fn ref_count(&self, hash: &str) -> Result<u64> {
        Ok(self
            .read_meta(&self.meta_path(hash))
            .await?
            .map(|m| m.ref_count)
            .unwrap_or(0))
    }

    /// Increment the reference count of an existing blob (dedup path where
    /// the caller has no bytes in hand, e.g. version rollback).
    pub async fn add_ref(&self, hash: &str) -> Result<u64> {
        let lock = self.lock_for(hash);
        let _guard = lock.lock().await;

        let meta_path = self.meta_path(hash);
        let Some(mut meta) = self.read_meta(&meta_path).await? else {
            return Err(StorageError::NotFound(format!("blob {}", hash)));
        };
        meta.ref_count += 1;
        self.write_meta(&meta_path, &meta).await?;
        Ok(meta.ref_count)
    }

    /// Decrement the reference count, deleting blob and meta on zero and
    /// pruning the now-empty directory rungs. Idempotent: releasing a hash
    /// that is already gone returns `true`.
    pub async fn release(&self, hash: &str) -> Result<bool> {
        let lock = self.lock_for(hash);
        let _guard = lock.lock().await;

        let meta_path = self.meta_path(hash);
        let Some(mut meta) = self.read_meta(&meta_path).await? else {
            return Ok(true);
        };

        meta.ref_count = meta.ref_count.saturating_sub(1);
        if meta.ref_count > 0 {
            self.write_meta(&meta_path, &meta).await?;
            tracing::debug!("Blob {} ref_count -> {}", hash, meta.ref_count);
            return Ok(false);
        }

        let blob_path = self.blob_path(hash);
        let _ = tokio::fs::remove_file(&blob_path).await;
        let _ = tokio::fs::remove_file(&meta_path).await;
        self.prune_empty_dirs(&blob_path).await;
        tracing::debug!("Blob {} purged", hash);
        Ok(true)
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        let (a, b) = shard(hash);
        self.root.join(a).join(b).join(hash)
    }

    fn meta_path(&self, hash: &str) -> PathBuf {
        let (a, b) = shard(hash);
        self.root.join(a).join(b).join(format!("{hash}.meta"))
    }

    fn lock_for(&self, hash: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(hash.to_string()).or_default())
    }

    async fn read_meta(&self, meta_path: &Path) -> Result<Option<BlobMeta>> {
        match tokio::fs::read(meta_path).await {
            Ok(bytes) => {
                let meta = serde_json::from_slice(&bytes).map_err(|e| {
                    StorageError::Corruption(format!(
                        "unreadable meta {}: {}",
                        meta_path.display(),
                        e
                    ))
                })?;
                Ok(Some(meta))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_meta(&self, meta_path: &Path, meta: &BlobMeta) -> Result<()> {
        let bytes = serde_json::to_vec(meta)
            .map_err(|e| StorageError::InvalidState(format!("meta encode: {}", e)))?;
        if let Some(parent) = meta_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.write_atomic(meta_path, &bytes, false).await
    }

    /// Temp-file + rename, retried with capped exponential backoff and
    /// jitter on transient errors.
    async fn write_atomic(&self, path: &Path, bytes: &[u8], fsync: bool) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.try_write_atomic(path, bytes, fsync).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.config.max_retries => {
                    let backoff = self.config.retry_base_delay * 2u32.pow(attempt);
                    let jitter_ms = rand::thread_rng()
                        .gen_range(0..=self.config.retry_base_delay.as_millis().max(1) as u64);
                    tracing::warn!(
                        "Write to {} failed (attempt {}): {}; retrying",
                        path.display(),
                        attempt + 1,
                        e
                    );
                    tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn try_write_atomic(
        &self,
        path: &Path,
        bytes: &[u8],
        fsync: bool,
    ) -> std::io::Result<()> {
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, bytes).await?;
        if fsync {
            let file = tokio::fs::OpenOptions::new().write(true).open(&tmp).await?;
            file.sync_all().await?;
        }
        match tokio::fs::rename(&tmp, path).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e)
            }
        }
    }

    /// Drop the `aa/bb` and `aa` rungs when the final release emptied them.
    async fn prune_empty_dirs(&self, blob_path: &Path) {
        if let Some(shard_dir) = blob_path.parent() {
            if tokio::fs::remove_dir(shard_dir).await.is_ok() {
                if let Some(top_dir) = shard_dir.parent() {
                    let _ = tokio::fs::remove_dir(top_dir).await;
                }
            }
        }
    }
}

fn shard(hash: &str) -> (&str, &str) {
    let a = hash.get(0..2).unwrap_or("00");
    let b = hash.get(2..4).unwrap_or("00");
    (a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, CasStore) {
        let dir = TempDir::new().unwrap();
        let store = CasStore::with_defaults(dir.path().join("cas"));
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_read_round_trip() {
        let (_dir, cas) = store();
        let (hash, is_new) = cas.put(b"hello world", None).await.unwrap();
        assert!(is_new);
        assert_eq!(cas.read(&hash, true).await.unwrap(), b"hello world");
        assert_eq!(cas.ref_count(&hash).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dedup_increments_ref_count() {
        let (_dir, cas) = store();
        let (hash, first) = cas.put(b"same bytes", None).await.unwrap();
        let (hash2, second) = cas.put(b"same bytes", None).await.unwrap();

        assert_eq!(hash, hash2);
        assert!(first);
        assert!(!second);
        assert_eq!(cas.ref_count(&hash).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_release_until_purged_and_rungs_pruned() {
        let (dir, cas) = store();
        let (hash, _) = cas.put(b"refcounted", None).await.unwrap();
        cas.store(&hash, b"refcounted", None).await.unwrap();

        // First release keeps the blob.
        assert!(!cas.release(&hash).await.unwrap());
        assert!(cas.exists(&hash).await);

        // Final release purges blob, meta, and empty shard directories.
        assert!(cas.release(&hash).await.unwrap());
        assert!(!cas.exists(&hash).await);
        let top = dir.path().join("cas").join(&hash[0..2]);
        assert!(!top.exists());

        // Releasing again is a benign true.
        assert!(cas.release(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_rejects_wrong_hash() {
        let (_dir, cas) = store();
        let result = cas.store(&"0".repeat(64), b"bytes", None).await;
        assert!(matches!(result, Err(StorageError::Corruption(_))));
    }

    #[tokio::test]
    async fn test_read_verify_detects_tampering() {
        let (dir, cas) = store();
        let (hash, _) = cas.put(b"original", None).await.unwrap();

        // Corrupt the blob on disk behind the store's back.
        let blob = dir
            .path()
            .join("cas")
            .join(&hash[0..2])
            .join(&hash[2..4])
            .join(&hash);
        std::fs::write(&blob, b"tampered").unwrap();

        assert!(cas.read(&hash, false).await.is_ok());
        assert!(matches!(cas.read(&hash, true).await, Err(StorageError::Corruption(_))));
    }

    #[tokio::test]
    async fn test_missing_blob_is_not_found() {
        let (_dir, cas) = store();
        let missing = CasStore::hash_bytes(b"never stored");
        assert!(matches!(cas.read(&missing, false).await, Err(StorageError::NotFound(_))));
        assert_eq!(cas.ref_count(&missing).await.unwrap(), 0);
        assert!(!cas.exists(&missing).await);
    }

    #[tokio::test]
    async fn test_empty_content_is_a_valid_blob() {
        let (_dir, cas) = store();
        let (hash, is_new) = cas.put(b"", None).await.unwrap();
        assert!(is_new);
        assert_eq!(cas.read(&hash, true).await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_add_ref_requires_existing_blob() {
        let (_dir, cas) = store();
        let (hash, _) = cas.put(b"x", None).await.unwrap();
        assert_eq!(cas.add_ref(&hash).await.unwrap(), 2);

        let missing = CasStore::hash_bytes(b"missing");
        assert!(matches!(cas.add_ref(&missing).await, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_extra_metadata_is_merged() {
        let (_dir, cas) = store();
        let (hash, _) = cas
            .put(b"tagged", Some(vec![("origin".into(), "upload".into())]))
            .await
            .unwrap();
        cas.store(&hash, b"tagged", Some(vec![("origin".into(), "upload".into())]))
            .await
            .unwrap();
        assert_eq!(cas.ref_count(&hash).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_stores_serialize_on_hash_lock() {
        let (_dir, cas) = store();
        let cas = Arc::new(cas);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cas = Arc::clone(&cas);
            handles.push(tokio::spawn(async move {
                cas.put(b"contended", None).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let hash = CasStore::hash_bytes(b"contended");
        assert_eq!(cas.ref_count(&hash).await.unwrap(), 8);
    }
}
