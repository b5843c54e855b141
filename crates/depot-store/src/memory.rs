//! In-memory store implementations.
//!
//! Backing for tests and single-node deployments. Locking layout: one
//! `RwLock` per table, plus a per-task `Mutex` map for exclusive leases.
//! The ledger stores expiry timestamps and filters lapsed entries on
//! read, so no background eviction is needed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use depot_core::models::{
    FileReference, FileStatus, PendingActivation, PhysicalFile, StorageCopy, UploadTask,
};
use depot_core::{ContentHash, DepotError, DepotResult};

use crate::traits::{PhysicalFileStore, ProcessedMessageStore, TaskLease, TaskStore};

/// In-memory task store with version checks and per-task leases.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<Uuid, UploadTask>>,
    leases: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lease_for(&self, task_id: Uuid) -> Arc<Mutex<()>> {
        let mut leases = self.leases.lock().await;
        leases.entry(task_id).or_default().clone()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save(&self, task: &UploadTask) -> DepotResult<UploadTask> {
        let mut tasks = self.tasks.write().await;
        if let Some(stored) = tasks.get(&task.task_id) {
            if stored.version != task.version {
                return Err(DepotError::StateConflict {
                    task_id: task.task_id,
                    operation: "save",
                    status: format!(
                        "version mismatch (stored {}, saving {})",
                        stored.version, task.version
                    ),
                });
            }
        }
        let mut saved = task.clone();
        saved.version += 1;
        tasks.insert(saved.task_id, saved.clone());
        Ok(saved)
    }

    async fn find(&self, task_id: Uuid) -> DepotResult<Option<UploadTask>> {
        Ok(self.tasks.read().await.get(&task_id).cloned())
    }

    async fn find_for_update(&self, task_id: Uuid) -> DepotResult<TaskLease> {
        let lease = self.lease_for(task_id).await;
        let guard = lease.lock_owned().await;
        // Reload after acquiring so the holder's last save is visible.
        let task = self
            .tasks
            .read()
            .await
            .get(&task_id)
            .cloned()
            .ok_or_else(|| DepotError::NotFound(format!("Task {}", task_id)))?;
        Ok(TaskLease::new(task, guard))
    }

    async fn find_expired(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> DepotResult<Vec<UploadTask>> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|t| t.is_expired(before))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_completed_before(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> DepotResult<Vec<UploadTask>> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|t| {
                t.status.is_terminal() && t.completed_at.map(|at| at < before).unwrap_or(false)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete(&self, task_id: Uuid) -> DepotResult<()> {
        self.tasks.write().await.remove(&task_id);
        self.leases.lock().await.remove(&task_id);
        Ok(())
    }
}

/// In-memory physical file and reference store.
#[derive(Default)]
pub struct InMemoryFileStore {
    // Single lock over both tables so batch activation is atomic.
    inner: RwLock<FileTables>,
}

#[derive(Default)]
struct FileTables {
    files: HashMap<ContentHash, PhysicalFile>,
    references: HashMap<String, FileReference>,
}

impl InMemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing_file(hash: ContentHash) -> DepotError {
    DepotError::NotFound(format!("Physical file {}", hash))
}

#[async_trait]
impl PhysicalFileStore for InMemoryFileStore {
    async fn insert(&self, file: &PhysicalFile) -> DepotResult<()> {
        let mut inner = self.inner.write().await;
        if inner.files.contains_key(&file.content_hash) {
            return Err(DepotError::StateConflict {
                task_id: Uuid::nil(),
                operation: "insert_physical_file",
                status: format!("hash {} already present", file.content_hash),
            });
        }
        inner.files.insert(file.content_hash, file.clone());
        Ok(())
    }

    async fn find_active_by_hash(&self, hash: ContentHash) -> DepotResult<Option<PhysicalFile>> {
        let inner = self.inner.read().await;
        Ok(inner
            .files
            .get(&hash)
            .filter(|f| f.status == FileStatus::Active)
            .cloned())
    }

    async fn find_by_hash(&self, hash: ContentHash) -> DepotResult<Option<PhysicalFile>> {
        Ok(self.inner.read().await.files.get(&hash).cloned())
    }

    async fn mark_active(&self, hash: ContentHash, node_id: &str, path: &str) -> DepotResult<()> {
        let mut inner = self.inner.write().await;
        let file = inner.files.get_mut(&hash).ok_or_else(|| missing_file(hash))?;
        let copy = StorageCopy {
            node_id: node_id.to_string(),
            path: path.to_string(),
        };
        if !file.copies.contains(&copy) {
            file.copies.push(copy);
        }
        file.status = FileStatus::Active;
        Ok(())
    }

    async fn increment_ref(&self, hash: ContentHash) -> DepotResult<i64> {
        let mut inner = self.inner.write().await;
        let file = inner.files.get_mut(&hash).ok_or_else(|| missing_file(hash))?;
        file.ref_count += 1;
        Ok(file.ref_count)
    }

    async fn decrement_ref(&self, hash: ContentHash) -> DepotResult<i64> {
        let mut inner = self.inner.write().await;
        let file = inner.files.get_mut(&hash).ok_or_else(|| missing_file(hash))?;
        file.ref_count -= 1;
        if file.ref_count <= 0 {
            file.status = FileStatus::Deleted;
        }
        Ok(file.ref_count)
    }

    async fn find_collectable(&self, limit: usize) -> DepotResult<Vec<PhysicalFile>> {
        let inner = self.inner.read().await;
        Ok(inner
            .files
            .values()
            .filter(|f| f.is_collectable())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn remove(&self, hash: ContentHash) -> DepotResult<()> {
        self.inner.write().await.files.remove(&hash);
        Ok(())
    }

    async fn insert_reference(&self, reference: &FileReference) -> DepotResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .references
            .insert(reference.file_key.clone(), reference.clone());
        Ok(())
    }

    async fn find_reference(&self, file_key: &str) -> DepotResult<Option<FileReference>> {
        Ok(self.inner.read().await.references.get(file_key).cloned())
    }

    async fn delete_reference(&self, file_key: &str) -> DepotResult<()> {
        self.inner.write().await.references.remove(file_key);
        Ok(())
    }

    async fn activate_batch(
        &self,
        task_id: Uuid,
        activations: Vec<PendingActivation>,
    ) -> DepotResult<()> {
        let mut inner = self.inner.write().await;
        // Validate everything before mutating anything.
        for activation in &activations {
            let file = inner
                .files
                .get(&activation.content_hash)
                .ok_or_else(|| missing_file(activation.content_hash))?;
            if file.status == FileStatus::Deleted {
                return Err(DepotError::Corruption(format!(
                    "Activation of {} targets a deleted physical file {}",
                    activation.file_key, activation.content_hash
                )));
            }
        }
        let now = Utc::now();
        for activation in activations {
            let file = inner
                .files
                .get_mut(&activation.content_hash)
                .ok_or_else(|| missing_file(activation.content_hash))?;
            let copy = StorageCopy {
                node_id: activation.node_id.clone(),
                path: activation.storage_path.clone(),
            };
            if !file.copies.contains(&copy) {
                file.copies.push(copy);
            }
            file.status = FileStatus::Active;
            file.ref_count += 1;
            let size = file.size;
            let content_type = file.content_type.clone();
            inner.references.insert(
                activation.file_key.clone(),
                FileReference {
                    file_key: activation.file_key,
                    task_id: Some(task_id),
                    content_hash: activation.content_hash,
                    size,
                    content_type,
                    filename: String::new(),
                    created_at: now,
                },
            );
        }
        Ok(())
    }
}

/// In-memory processed-message ledger with per-entry expiry.
#[derive(Default)]
pub struct InMemoryProcessedMessages {
    entries: RwLock<HashMap<Uuid, DateTime<Utc>>>,
}

impl InMemoryProcessedMessages {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessedMessageStore for InMemoryProcessedMessages {
    async fn is_processed(&self, message_id: Uuid) -> DepotResult<bool> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&message_id)
            .map(|expires| *expires > Utc::now())
            .unwrap_or(false))
    }

    async fn mark_processed(&self, message_id: Uuid, ttl: Duration) -> DepotResult<()> {
        let mut entries = self.entries.write().await;
        entries.retain(|_, expires| *expires > Utc::now());
        entries.insert(message_id, Utc::now() + ttl);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_core::models::{CallbackSpec, TaskStatus};

    fn new_task() -> UploadTask {
        UploadTask::new("file-key", vec![CallbackSpec::new("thumbnail")], 3600)
    }

    #[tokio::test]
    async fn test_save_bumps_version_and_rejects_stale_writers() {
        let store = InMemoryTaskStore::new();
        let task = new_task();

        let saved = store.save(&task).await.unwrap();
        assert_eq!(saved.version, 1);

        // The pre-save copy is stale now.
        let err = store.save(&task).await.unwrap_err();
        assert!(matches!(err, DepotError::StateConflict { .. }));

        let saved = store.save(&saved).await.unwrap();
        assert_eq!(saved.version, 2);
    }

    #[tokio::test]
    async fn test_find_for_update_is_exclusive() {
        let store = Arc::new(InMemoryTaskStore::new());
        let task = store.save(&new_task()).await.unwrap();

        let lease = store.find_for_update(task.task_id).await.unwrap();

        let contender = {
            let store = store.clone();
            let task_id = task.task_id;
            tokio::spawn(async move { store.find_for_update(task_id).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(lease);
        contender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_find_expired_skips_terminal_tasks() {
        let store = InMemoryTaskStore::new();
        let mut stale = new_task();
        stale.expires_at = Utc::now() - Duration::hours(1);
        store.save(&stale).await.unwrap();

        let mut done = new_task();
        done.expires_at = Utc::now() - Duration::hours(1);
        done.mark_failed("boom").unwrap();
        store.save(&done).await.unwrap();

        let expired = store.find_expired(Utc::now(), 10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].task_id, stale.task_id);
        assert_eq!(expired[0].status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_decrement_to_zero_marks_deleted() {
        let store = InMemoryFileStore::new();
        let file = PhysicalFile::new_pending(ContentHash(42), 10, "text/plain");
        store.insert(&file).await.unwrap();
        store.mark_active(ContentHash(42), "node-a", "files/a").await.unwrap();

        assert_eq!(store.increment_ref(ContentHash(42)).await.unwrap(), 1);
        assert_eq!(store.increment_ref(ContentHash(42)).await.unwrap(), 2);
        assert_eq!(store.decrement_ref(ContentHash(42)).await.unwrap(), 1);
        assert!(store.find_collectable(10).await.unwrap().is_empty());

        assert_eq!(store.decrement_ref(ContentHash(42)).await.unwrap(), 0);
        let collectable = store.find_collectable(10).await.unwrap();
        assert_eq!(collectable.len(), 1);
        assert_eq!(collectable[0].status, FileStatus::Deleted);
    }

    #[tokio::test]
    async fn test_pending_files_invisible_to_dedup_lookup() {
        let store = InMemoryFileStore::new();
        let file = PhysicalFile::new_pending(ContentHash(7), 10, "text/plain");
        store.insert(&file).await.unwrap();

        assert!(store.find_active_by_hash(ContentHash(7)).await.unwrap().is_none());
        store.mark_active(ContentHash(7), "node-a", "files/x").await.unwrap();
        assert!(store.find_active_by_hash(ContentHash(7)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_activate_batch_rejects_all_on_one_bad_entry() {
        let store = InMemoryFileStore::new();
        let good = PhysicalFile::new_pending(ContentHash(1), 10, "image/png");
        store.insert(&good).await.unwrap();

        let activations = vec![
            PendingActivation {
                file_key: "derived-1".into(),
                content_hash: ContentHash(1),
                storage_path: "files/d1".into(),
                node_id: "node-a".into(),
            },
            PendingActivation {
                file_key: "derived-2".into(),
                content_hash: ContentHash(999),
                storage_path: "files/d2".into(),
                node_id: "node-a".into(),
            },
        ];
        let err = store
            .activate_batch(Uuid::new_v4(), activations)
            .await
            .unwrap_err();
        assert!(matches!(err, DepotError::NotFound(_)));

        // Nothing was applied.
        assert!(store.find_reference("derived-1").await.unwrap().is_none());
        assert_eq!(store.find_by_hash(ContentHash(1)).await.unwrap().unwrap().ref_count, 0);
    }

    #[tokio::test]
    async fn test_activate_batch_binds_references() {
        let store = InMemoryFileStore::new();
        let file = PhysicalFile::new_pending(ContentHash(5), 64, "image/webp");
        store.insert(&file).await.unwrap();

        let task_id = Uuid::new_v4();
        store
            .activate_batch(
                task_id,
                vec![PendingActivation {
                    file_key: "thumb-key".into(),
                    content_hash: ContentHash(5),
                    storage_path: "files/thumb".into(),
                    node_id: "node-a".into(),
                }],
            )
            .await
            .unwrap();

        let reference = store.find_reference("thumb-key").await.unwrap().unwrap();
        assert_eq!(reference.task_id, Some(task_id));
        let file = store.find_by_hash(ContentHash(5)).await.unwrap().unwrap();
        assert_eq!(file.ref_count, 1);
        assert_eq!(file.status, FileStatus::Active);
    }

    #[tokio::test]
    async fn test_ledger_entries_lapse() {
        let ledger = InMemoryProcessedMessages::new();
        let id = Uuid::new_v4();

        assert!(!ledger.is_processed(id).await.unwrap());
        ledger.mark_processed(id, Duration::hours(1)).await.unwrap();
        assert!(ledger.is_processed(id).await.unwrap());

        let lapsed = Uuid::new_v4();
        ledger.mark_processed(lapsed, Duration::seconds(-1)).await.unwrap();
        assert!(!ledger.is_processed(lapsed).await.unwrap());
    }
}
