//! Upload service.
//!
//! The write-side API of the engine: task creation, the session-based
//! multipart upload protocol, dedup binding on completion, the instant
//! upload shortcut, and the periodic sweeps (expiry, retention, garbage
//! collection).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use depot_core::models::{
    CallbackSpec, TaskMessage, TaskStatus, UploadCompletion, UploadPart, UploadTask,
};
use depot_core::{ContentHash, DepotError, DepotResult};
use depot_storage::{CompletedPart, Storage, StorageError, UploadSession};
use depot_store::{DedupEngine, TaskStore};

use crate::filter::ExistenceFilter;
use crate::transport::MessageTransport;

pub struct UploadService {
    tasks: Arc<dyn TaskStore>,
    dedup: Arc<DedupEngine>,
    storage: Arc<dyn Storage>,
    transport: Arc<dyn MessageTransport>,
    filter: Arc<dyn ExistenceFilter>,
    node_id: String,
    task_ttl_secs: i64,
}

impl UploadService {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        dedup: Arc<DedupEngine>,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn MessageTransport>,
        filter: Arc<dyn ExistenceFilter>,
        node_id: String,
        task_ttl_secs: i64,
    ) -> Self {
        UploadService {
            tasks,
            dedup,
            storage,
            transport,
            filter,
            node_id,
            task_ttl_secs,
        }
    }

    fn storage_key(task: &UploadTask) -> String {
        format!("files/{}", task.task_id)
    }

    fn guard_not_terminal(task: &UploadTask, operation: &'static str) -> DepotResult<()> {
        if task.status.is_terminal() {
            return Err(DepotError::StateConflict {
                task_id: task.task_id,
                operation,
                status: task.status.to_string(),
            });
        }
        Ok(())
    }

    /// Create a PENDING task and register it with the existence filter.
    /// Filter registration degrades open: a failed write only costs one
    /// pointless store lookup later.
    #[tracing::instrument(skip(self, callbacks))]
    pub async fn create_task(
        &self,
        user_file_key: &str,
        callbacks: Vec<CallbackSpec>,
    ) -> DepotResult<UploadTask> {
        if user_file_key.is_empty() {
            return Err(DepotError::Validation("File key must not be empty".into()));
        }
        let task = UploadTask::new(user_file_key, callbacks, self.task_ttl_secs);
        let saved = self.tasks.save(&task).await?;

        if let Err(e) = self.filter.register(saved.task_id).await {
            tracing::warn!(task_id = %saved.task_id, error = %e, "Existence filter registration failed");
        }
        tracing::info!(task_id = %saved.task_id, file_key = %user_file_key, "Upload task created");
        Ok(saved)
    }

    pub async fn find_task(&self, task_id: Uuid) -> DepotResult<Option<UploadTask>> {
        self.tasks.find(task_id).await
    }

    /// Begin the upload: opens a multipart session and moves the task to
    /// IN_PROGRESS.
    #[tracing::instrument(skip(self))]
    pub async fn start_upload(&self, task_id: Uuid) -> DepotResult<UploadTask> {
        let mut lease = self.tasks.find_for_update(task_id).await?;
        let storage_key = Self::storage_key(&lease.task);
        let session = self.storage.begin_upload(&storage_key).await?;
        lease
            .task
            .start_upload(session.session_id(), &self.node_id, &storage_key)?;
        self.tasks.save(&lease.task).await
    }

    /// Upload one part. Parts may arrive in any order and may be
    /// re-uploaded; the latest bytes for a part number win.
    #[tracing::instrument(skip(self, data))]
    pub async fn upload_part(
        &self,
        task_id: Uuid,
        part_number: i32,
        data: Vec<u8>,
    ) -> DepotResult<String> {
        let mut lease = self.tasks.find_for_update(task_id).await?;
        Self::guard_not_terminal(&lease.task, "upload_part")?;
        let size = data.len() as i64;
        let session = self.resume_session(&lease.task).await?;
        let etag = session.upload_part(part_number, data).await?;
        lease.task.record_part(UploadPart {
            part_number,
            checksum: etag.clone(),
            size,
        })?;
        self.tasks.save(&lease.task).await?;
        Ok(etag)
    }

    /// Complete the upload: assembles the parts, fingerprints the bytes,
    /// binds the file key through the dedup engine, and publishes the
    /// processing message when callbacks are configured.
    #[tracing::instrument(skip(self))]
    pub async fn complete_upload(
        &self,
        task_id: Uuid,
        filename: &str,
        content_type: &str,
    ) -> DepotResult<UploadTask> {
        let mut lease = self.tasks.find_for_update(task_id).await?;
        Self::guard_not_terminal(&lease.task, "complete_upload")?;
        let session = self.resume_session(&lease.task).await?;

        let completed_parts: Vec<CompletedPart> = lease
            .task
            .parts
            .iter()
            .map(|p| CompletedPart {
                part_number: p.part_number,
                etag: p.checksum.clone(),
            })
            .collect();
        if completed_parts.is_empty() {
            return Err(DepotError::Validation(format!(
                "Task {} has no uploaded parts",
                task_id
            )));
        }
        let mut storage_path = session.complete(completed_parts).await?;

        let data = self.storage.download(&storage_path).await?;
        let content_hash = ContentHash::of_bytes(&data);
        let total_size = data.len() as i64;

        // Dedup: identical bytes already active means the freshly
        // assembled copy is redundant and the existing copy is reused.
        match self.dedup.find_active(content_hash).await? {
            Some(existing) => {
                let existing_path = existing
                    .copies
                    .first()
                    .map(|c| c.path.clone())
                    .ok_or_else(|| {
                        DepotError::Corruption(format!(
                            "Active physical file {} has no storage copies",
                            content_hash
                        ))
                    })?;
                if existing_path != storage_path {
                    if let Err(e) = self.storage.delete(&storage_path).await {
                        tracing::warn!(path = %storage_path, error = %e, "Failed to drop redundant copy");
                    }
                    storage_path = existing_path;
                }
                tracing::info!(task_id = %task_id, hash = %content_hash, "Upload deduplicated");
            }
            None => {
                if self.dedup.find_by_hash(content_hash).await?.is_none() {
                    self.dedup
                        .register_pending(content_hash, total_size, content_type)
                        .await?;
                }
                self.dedup.confirm_copy(content_hash, &storage_path).await?;
            }
        }
        // The state transition is validated before the refcount moves;
        // a rejected transition must not leave an extra reference behind.
        // Nothing is persisted until the save below, so a failed
        // acquisition discards the in-memory transition too.
        lease.task.complete_upload(UploadCompletion {
            content_hash,
            total_size,
            content_type: content_type.to_string(),
            filename: filename.to_string(),
            storage_path,
        })?;
        self.dedup
            .acquire_reference(content_hash, &lease.task.user_file_key, Some(task_id), filename)
            .await?;
        let saved = self.tasks.save(&lease.task).await?;
        self.publish_if_processing(&saved).await?;
        Ok(saved)
    }

    /// The instant-upload shortcut: if the declared hash is already
    /// active, bind the file key without transferring any bytes. Returns
    /// `None` when the bytes are unknown and a real upload is required.
    #[tracing::instrument(skip(self))]
    pub async fn complete_instant(
        &self,
        task_id: Uuid,
        content_hash: ContentHash,
        filename: &str,
    ) -> DepotResult<Option<UploadTask>> {
        let mut lease = self.tasks.find_for_update(task_id).await?;
        Self::guard_not_terminal(&lease.task, "complete_instant")?;

        let Some(existing) = self.dedup.find_active(content_hash).await? else {
            return Ok(None);
        };
        let storage_path = existing
            .copies
            .first()
            .map(|c| c.path.clone())
            .ok_or_else(|| {
                DepotError::Corruption(format!(
                    "Active physical file {} has no storage copies",
                    content_hash
                ))
            })?;

        // Transition first, reference second: on a state conflict the
        // refcount must stay untouched.
        lease.task.complete_upload(UploadCompletion {
            content_hash,
            total_size: existing.size,
            content_type: existing.content_type,
            filename: filename.to_string(),
            storage_path,
        })?;
        self.dedup
            .acquire_reference(content_hash, &lease.task.user_file_key, Some(task_id), filename)
            .await?;
        let saved = self.tasks.save(&lease.task).await?;
        self.publish_if_processing(&saved).await?;
        tracing::info!(task_id = %task_id, hash = %content_hash, "Instant upload completed");
        Ok(Some(saved))
    }

    /// Abort an upload that has not entered processing. The storage
    /// session abort is idempotent, so repeating an abort is harmless.
    #[tracing::instrument(skip(self))]
    pub async fn abort(&self, task_id: Uuid) -> DepotResult<UploadTask> {
        let mut lease = self.tasks.find_for_update(task_id).await?;
        if let (Some(session_id), Some(storage_path)) =
            (lease.task.session_id.clone(), lease.task.storage_path.clone())
        {
            match self.storage.resume_upload(&storage_path, &session_id).await {
                Ok(session) => session.abort().await?,
                Err(StorageError::SessionNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        lease.task.abort()?;
        self.tasks.save(&lease.task).await
    }

    /// Move tasks past their TTL to EXPIRED. Returns the number swept.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_expired(&self, now: DateTime<Utc>, limit: usize) -> DepotResult<usize> {
        let expired = self.tasks.find_expired(now, limit).await?;
        let mut swept = 0;
        for task in expired {
            let mut lease = match self.tasks.find_for_update(task.task_id).await {
                Ok(lease) => lease,
                Err(DepotError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if lease.task.status.is_terminal() {
                continue;
            }
            lease.task.mark_expired();
            self.tasks.save(&lease.task).await?;
            swept += 1;
        }
        if swept > 0 {
            tracing::info!(swept = swept, "Expired task sweep finished");
        }
        Ok(swept)
    }

    /// Delete terminal task records older than `before`. File references
    /// and bytes are untouched; only the lifecycle records go.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup_finished(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> DepotResult<usize> {
        let finished = self.tasks.find_completed_before(before, limit).await?;
        let count = finished.len();
        for task in finished {
            self.tasks.delete(task.task_id).await?;
        }
        if count > 0 {
            tracing::info!(removed = count, "Finished task cleanup done");
        }
        Ok(count)
    }

    /// Run one garbage-collection sweep over unreferenced files.
    pub async fn collect_garbage(&self, limit: usize) -> DepotResult<usize> {
        self.dedup.collect_garbage(limit).await
    }

    async fn resume_session(&self, task: &UploadTask) -> DepotResult<Box<dyn UploadSession>> {
        let session_id = task.session_id.as_deref().ok_or_else(|| {
            DepotError::StateConflict {
                task_id: task.task_id,
                operation: "resume_session",
                status: task.status.to_string(),
            }
        })?;
        let storage_path = task.storage_path.as_deref().ok_or_else(|| {
            DepotError::StateConflict {
                task_id: task.task_id,
                operation: "resume_session",
                status: task.status.to_string(),
            }
        })?;
        Ok(self.storage.resume_upload(storage_path, session_id).await?)
    }

    async fn publish_if_processing(&self, task: &UploadTask) -> DepotResult<()> {
        if task.status == TaskStatus::Processing {
            self.transport
                .publish(TaskMessage::new(task.task_id, task.expires_at))
                .await?;
        }
        Ok(())
    }
}
