//! Store abstraction traits
//!
//! Three seams back the engine: tasks, physical files with their
//! references, and the processed-message ledger. All writes to a task go
//! through `TaskStore::save`, which enforces the version token; the
//! chain runner additionally takes an exclusive lease so no two runners
//! mutate the same task concurrently.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use depot_core::models::{FileReference, PendingActivation, PhysicalFile, UploadTask};
use depot_core::{ContentHash, DepotResult};

/// An exclusively-held task. The lease guard is released on drop; while
/// held, no other `find_for_update` on the same task returns.
pub struct TaskLease {
    pub task: UploadTask,
    _guard: OwnedMutexGuard<()>,
}

impl TaskLease {
    pub fn new(task: UploadTask, guard: OwnedMutexGuard<()>) -> Self {
        TaskLease {
            task,
            _guard: guard,
        }
    }
}

/// Task persistence.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist the task. Fails with a state conflict when the stored
    /// version no longer matches the task's version token; on success the
    /// caller's copy is stale and must be reloaded before further saves.
    async fn save(&self, task: &UploadTask) -> DepotResult<UploadTask>;

    async fn find(&self, task_id: Uuid) -> DepotResult<Option<UploadTask>>;

    /// Load the task under an exclusive lease. Blocks until any current
    /// holder releases.
    async fn find_for_update(&self, task_id: Uuid) -> DepotResult<TaskLease>;

    /// Non-terminal tasks whose expiry passed before `before`.
    async fn find_expired(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> DepotResult<Vec<UploadTask>>;

    /// Terminal tasks whose completion timestamp predates `before`, for
    /// the retention sweep.
    async fn find_completed_before(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> DepotResult<Vec<UploadTask>>;

    async fn delete(&self, task_id: Uuid) -> DepotResult<()>;
}

/// Physical file and file reference persistence.
#[async_trait]
pub trait PhysicalFileStore: Send + Sync {
    async fn insert(&self, file: &PhysicalFile) -> DepotResult<()>;

    /// Look up an ACTIVE physical file by content hash. PENDING and
    /// DELETED records are invisible to the dedup path.
    async fn find_active_by_hash(&self, hash: ContentHash) -> DepotResult<Option<PhysicalFile>>;

    async fn find_by_hash(&self, hash: ContentHash) -> DepotResult<Option<PhysicalFile>>;

    /// Confirm a storage copy and move the record PENDING → ACTIVE.
    async fn mark_active(&self, hash: ContentHash, node_id: &str, path: &str) -> DepotResult<()>;

    /// Bump the reference count; returns the new count.
    async fn increment_ref(&self, hash: ContentHash) -> DepotResult<i64>;

    /// Drop one reference; at zero the record moves to DELETED and waits
    /// for the garbage-collection sweep. Returns the new count.
    async fn decrement_ref(&self, hash: ContentHash) -> DepotResult<i64>;

    /// DELETED records with no remaining references, for the GC sweep.
    async fn find_collectable(&self, limit: usize) -> DepotResult<Vec<PhysicalFile>>;

    async fn remove(&self, hash: ContentHash) -> DepotResult<()>;

    async fn insert_reference(&self, reference: &FileReference) -> DepotResult<()>;

    async fn find_reference(&self, file_key: &str) -> DepotResult<Option<FileReference>>;

    async fn delete_reference(&self, file_key: &str) -> DepotResult<()>;

    /// Commit a chain's derived files in one batch: each activation binds
    /// its file key to the physical file and takes a reference. Applied
    /// atomically, never partially.
    async fn activate_batch(
        &self,
        task_id: Uuid,
        activations: Vec<PendingActivation>,
    ) -> DepotResult<()>;
}

/// The message-dedup ledger. Both operations are fallible so callers can
/// choose a degradation policy when the ledger is unreachable.
#[async_trait]
pub trait ProcessedMessageStore: Send + Sync {
    async fn is_processed(&self, message_id: Uuid) -> DepotResult<bool>;

    /// Record the message as processed. The entry lapses after `ttl`,
    /// after which redelivery would be handled by task-status checks.
    async fn mark_processed(&self, message_id: Uuid, ttl: Duration) -> DepotResult<()>;
}
