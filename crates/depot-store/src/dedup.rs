//! Content-addressed deduplication engine.
//!
//! Sits on top of the physical file store: binds logical file keys to
//! physical files by content hash, tracks reference counts, and runs the
//! deferred garbage-collection sweep that actually deletes bytes.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use depot_core::models::{FileReference, PhysicalFile};
use depot_core::{ContentHash, DepotError, DepotResult};
use depot_storage::{Storage, StorageError};

use crate::traits::PhysicalFileStore;

pub struct DedupEngine {
    files: Arc<dyn PhysicalFileStore>,
    storage: Arc<dyn Storage>,
    node_id: String,
}

impl DedupEngine {
    pub fn new(files: Arc<dyn PhysicalFileStore>, storage: Arc<dyn Storage>, node_id: String) -> Self {
        DedupEngine {
            files,
            storage,
            node_id,
        }
    }

    /// The instant-upload check: an ACTIVE physical file with this hash
    /// means the bytes already exist and need not be transferred.
    pub async fn find_active(&self, hash: ContentHash) -> DepotResult<Option<PhysicalFile>> {
        self.files.find_active_by_hash(hash).await
    }

    /// Look up the physical file record whatever its status.
    pub async fn find_by_hash(&self, hash: ContentHash) -> DepotResult<Option<PhysicalFile>> {
        self.files.find_by_hash(hash).await
    }

    /// Record first-time content: a PENDING physical file that becomes
    /// visible to dedup only once a storage copy is confirmed.
    pub async fn register_pending(
        &self,
        hash: ContentHash,
        size: i64,
        content_type: &str,
    ) -> DepotResult<()> {
        self.files
            .insert(&PhysicalFile::new_pending(hash, size, content_type))
            .await
    }

    /// Confirm the bytes landed at `storage_path` on this node and move
    /// the record to ACTIVE.
    pub async fn confirm_copy(&self, hash: ContentHash, storage_path: &str) -> DepotResult<()> {
        self.files
            .mark_active(hash, &self.node_id, storage_path)
            .await
    }

    /// Bind `file_key` to the physical file, taking one reference.
    #[tracing::instrument(skip(self), fields(hash = %hash))]
    pub async fn acquire_reference(
        &self,
        hash: ContentHash,
        file_key: &str,
        task_id: Option<Uuid>,
        filename: &str,
    ) -> DepotResult<FileReference> {
        let file = self
            .files
            .find_by_hash(hash)
            .await?
            .ok_or_else(|| DepotError::NotFound(format!("Physical file {}", hash)))?;

        let ref_count = self.files.increment_ref(hash).await?;
        let reference = FileReference {
            file_key: file_key.to_string(),
            task_id,
            content_hash: hash,
            size: file.size,
            content_type: file.content_type,
            filename: filename.to_string(),
            created_at: Utc::now(),
        };
        self.files.insert_reference(&reference).await?;

        tracing::debug!(
            file_key = %file_key,
            ref_count = ref_count,
            "File reference acquired"
        );
        Ok(reference)
    }

    /// Release a logical file: removes the reference and drops one
    /// refcount. The bytes stay until the next garbage-collection sweep.
    #[tracing::instrument(skip(self))]
    pub async fn release_reference(&self, file_key: &str) -> DepotResult<()> {
        let reference = self
            .files
            .find_reference(file_key)
            .await?
            .ok_or_else(|| DepotError::NotFound(format!("File reference {}", file_key)))?;

        self.files.delete_reference(file_key).await?;
        let ref_count = self.files.decrement_ref(reference.content_hash).await?;

        tracing::debug!(
            hash = %reference.content_hash,
            ref_count = ref_count,
            "File reference released"
        );
        Ok(())
    }

    /// Delete the bytes of unreferenced DELETED files and drop their
    /// records. Copies on other nodes are left for their owners' sweeps.
    /// Returns the number of records collected.
    #[tracing::instrument(skip(self))]
    pub async fn collect_garbage(&self, limit: usize) -> DepotResult<usize> {
        let collectable = self.files.find_collectable(limit).await?;
        let mut collected = 0;

        for file in collectable {
            let mut removable = true;
            for copy in &file.copies {
                if copy.node_id != self.node_id {
                    removable = false;
                    continue;
                }
                match self.storage.delete(&copy.path).await {
                    Ok(()) | Err(StorageError::NotFound(_)) => {}
                    Err(e) => {
                        tracing::warn!(
                            hash = %file.content_hash,
                            path = %copy.path,
                            error = %e,
                            "Garbage collection delete failed, will retry next sweep"
                        );
                        removable = false;
                    }
                }
            }
            if removable {
                self.files.remove(file.content_hash).await?;
                collected += 1;
            }
        }

        if collected > 0 {
            tracing::info!(collected = collected, "Garbage collection sweep finished");
        }
        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryFileStore;
    use depot_storage::LocalStorage;
    use tempfile::TempDir;

    async fn engine() -> (TempDir, Arc<dyn Storage>, DedupEngine) {
        let dir = TempDir::new().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(
            LocalStorage::new(dir.path(), "http://localhost/files".into())
                .await
                .unwrap(),
        );
        let files: Arc<dyn PhysicalFileStore> = Arc::new(InMemoryFileStore::new());
        let engine = DedupEngine::new(files, storage.clone(), "node-a".into());
        (dir, storage, engine)
    }

    #[tokio::test]
    async fn test_pending_not_visible_until_confirmed() {
        let (_dir, _storage, engine) = engine().await;
        let hash = ContentHash(11);
        engine.register_pending(hash, 3, "text/plain").await.unwrap();
        assert!(engine.find_active(hash).await.unwrap().is_none());

        engine.confirm_copy(hash, "files/a").await.unwrap();
        assert!(engine.find_active(hash).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_then_sweep_deletes_bytes() {
        let (_dir, storage, engine) = engine().await;
        let data = b"shared bytes".to_vec();
        let hash = ContentHash::of_bytes(&data);
        storage.upload("files/shared", data, "text/plain").await.unwrap();

        engine.register_pending(hash, 12, "text/plain").await.unwrap();
        engine.confirm_copy(hash, "files/shared").await.unwrap();
        engine
            .acquire_reference(hash, "key-1", None, "a.txt")
            .await
            .unwrap();
        engine
            .acquire_reference(hash, "key-2", None, "b.txt")
            .await
            .unwrap();

        // First release: still referenced, sweep collects nothing.
        engine.release_reference("key-1").await.unwrap();
        assert_eq!(engine.collect_garbage(10).await.unwrap(), 0);
        assert!(storage.exists("files/shared").await.unwrap());

        engine.release_reference("key-2").await.unwrap();
        assert_eq!(engine.collect_garbage(10).await.unwrap(), 1);
        assert!(!storage.exists("files/shared").await.unwrap());
        assert!(engine.find_active(hash).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_unknown_key_is_not_found() {
        let (_dir, _storage, engine) = engine().await;
        let err = engine.release_reference("nope").await.unwrap_err();
        assert!(matches!(err, DepotError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_sweep_ignores_foreign_copies() {
        let dir = TempDir::new().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(
            LocalStorage::new(dir.path(), "http://localhost/files".into())
                .await
                .unwrap(),
        );
        let files: Arc<dyn PhysicalFileStore> = Arc::new(InMemoryFileStore::new());
        let owner = DedupEngine::new(files.clone(), storage.clone(), "node-a".into());
        let foreign = DedupEngine::new(files.clone(), storage, "node-b".into());

        let hash = ContentHash(77);
        owner.register_pending(hash, 4, "text/plain").await.unwrap();
        owner.confirm_copy(hash, "files/mine").await.unwrap();
        owner
            .acquire_reference(hash, "key", None, "x.txt")
            .await
            .unwrap();
        owner.release_reference("key").await.unwrap();

        // The copy belongs to node-a, so node-b's sweep must leave it.
        assert_eq!(foreign.collect_garbage(10).await.unwrap(), 0);
        assert!(files.find_by_hash(hash).await.unwrap().is_some());
    }
}
