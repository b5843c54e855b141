//! Callback chain runner.
//!
//! Executes a task's callback chain to a terminal state. The task is
//! held under an exclusive lease for the whole run; the cursor and
//! context are checkpointed after every finished step so an interrupted
//! chain resumes exactly where it stopped. Each run materializes one
//! local working copy of the uploaded bytes, shared by every callback
//! and removed on every exit path.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use depot_core::models::{keys, CallbackSpec, DerivedFile, TaskStatus, UploadTask};
use depot_core::{DepotError, DepotResult};
use depot_plugins::{bind_invocation, Plugin, PluginInvocation, PluginOutcome, PluginRegistry, PluginSuccess};
use depot_storage::{Storage, StorageError};
use depot_store::{PhysicalFileStore, TaskLease, TaskStore};

use crate::notify::{Notification, Notifier};

/// How a chain run ended, from the consumer's point of view.
#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    /// The task was already terminal; nothing ran. The usual cause is a
    /// redelivered message whose ledger entry lapsed.
    AlreadyTerminal,
    Failed {
        reason: String,
    },
}

pub struct ChainRunner {
    tasks: Arc<dyn TaskStore>,
    files: Arc<dyn PhysicalFileStore>,
    storage: Arc<dyn Storage>,
    registry: PluginRegistry,
    notifier: Arc<dyn Notifier>,
    work_dir: PathBuf,
    callback_timeout: Duration,
    max_retries: u32,
    backoff_base: Duration,
}

/// Deletes the per-run working copy when the run ends, however it ends.
struct WorkingCopy {
    path: PathBuf,
}

impl Drop for WorkingCopy {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

enum StepResult {
    Success(PluginSuccess),
    Skip(String),
    Failed(String),
}

impl ChainRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        files: Arc<dyn PhysicalFileStore>,
        storage: Arc<dyn Storage>,
        registry: PluginRegistry,
        notifier: Arc<dyn Notifier>,
        work_dir: impl Into<PathBuf>,
        callback_timeout: Duration,
        max_retries: u32,
        backoff_base: Duration,
    ) -> Self {
        ChainRunner {
            tasks,
            files,
            storage,
            registry,
            notifier,
            work_dir: work_dir.into(),
            callback_timeout,
            max_retries,
            backoff_base,
        }
    }

    /// Run the task's chain from its checkpointed cursor to a terminal
    /// state. Returns `Err` only for infrastructure problems; expected
    /// chain failures come back as `RunOutcome::Failed` with the task
    /// already marked FAILED and saved.
    #[tracing::instrument(skip(self), fields(task_id = %task_id))]
    pub async fn run(&self, task_id: Uuid) -> DepotResult<RunOutcome> {
        let mut lease = self.tasks.find_for_update(task_id).await?;

        if lease.task.status.is_terminal() {
            tracing::debug!(status = %lease.task.status, "Task already terminal, nothing to run");
            return Ok(RunOutcome::AlreadyTerminal);
        }
        if lease.task.status != TaskStatus::Processing {
            let index = lease.task.current_callback_index;
            let reason = format!(
                "Chain run requested while task is {}",
                lease.task.status
            );
            return self.fail(lease, index, reason).await;
        }

        // Non-retryable setup errors must leave the task durably FAILED
        // before they surface; only transient storage trouble is left
        // for redelivery.
        if let Err(e) = self.seed_context(&mut lease.task) {
            let index = lease.task.current_callback_index;
            return self.fail(lease, index, e.to_string()).await;
        }
        let working = match self.materialize_working_copy(&lease.task).await {
            Ok(working) => working,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                let index = lease.task.current_callback_index;
                return self.fail(lease, index, e.to_string()).await;
            }
        };
        lease.task.context.insert(
            keys::LOCAL_PATH,
            json!(working.path.to_string_lossy().into_owned()),
        );
        lease.task = self.tasks.save(&lease.task).await?;

        while let Some(callback) = lease.task.current_callback().cloned() {
            let index = lease.task.current_callback_index;
            tracing::info!(
                plugin = %callback.plugin_name,
                index = index,
                "Executing callback"
            );

            let Some(plugin) = self.registry.get(&callback.plugin_name).await else {
                let reason = format!("Unknown plugin '{}'", callback.plugin_name);
                return self.fail(lease, index, reason).await;
            };

            let invocation = match bind_invocation(
                plugin.as_ref(),
                task_id,
                &callback,
                &lease.task.context,
            ) {
                Ok(invocation) => invocation,
                Err(e) => return self.fail(lease, index, e.to_string()).await,
            };

            match self.execute_step(plugin.as_ref(), invocation, &callback).await {
                StepResult::Success(success) => {
                    let new_files: Vec<DerivedFile> =
                        success.derived.iter().map(|(file, _)| file.clone()).collect();
                    lease
                        .task
                        .context
                        .merge_outputs(&callback.plugin_name, success.outputs);
                    for (file, activation) in success.derived {
                        lease.task.context.add_derived_file(file, activation);
                    }
                    for (key, value) in success.metadata_updates {
                        lease.task.context.queue_metadata_update(key, value);
                    }
                    lease.task.advance_callback()?;
                    lease.task = self.tasks.save(&lease.task).await?;

                    if !new_files.is_empty() {
                        self.send(Notification::DerivedFilesAdded {
                            task_id,
                            source_file_key: lease.task.user_file_key.clone(),
                            files: new_files,
                        })
                        .await;
                    }
                }
                StepResult::Skip(reason) => {
                    tracing::info!(plugin = %callback.plugin_name, reason = %reason, "Callback skipped");
                    lease.task.advance_callback()?;
                    lease.task = self.tasks.save(&lease.task).await?;
                }
                StepResult::Failed(reason) => {
                    return self.fail(lease, index, reason).await;
                }
            }
        }

        self.finish(lease).await
    }

    /// One callback with its local retry loop. Retryable failures,
    /// plugin errors, and timeouts back off exponentially up to the
    /// configured attempt budget; exhausting it is terminal.
    async fn execute_step(
        &self,
        plugin: &dyn Plugin,
        invocation: PluginInvocation,
        callback: &CallbackSpec,
    ) -> StepResult {
        let mut attempt: u32 = 0;
        loop {
            let result =
                tokio::time::timeout(self.callback_timeout, plugin.execute(invocation.clone()))
                    .await;
            let retry_reason = match result {
                Ok(Ok(PluginOutcome::Success(success))) => return StepResult::Success(success),
                Ok(Ok(PluginOutcome::Skip { reason })) => return StepResult::Skip(reason),
                Ok(Ok(PluginOutcome::Failure {
                    reason,
                    retryable: false,
                })) => return StepResult::Failed(reason),
                Ok(Ok(PluginOutcome::Failure {
                    reason,
                    retryable: true,
                })) => reason,
                Ok(Err(e)) => format!("plugin error: {:#}", e),
                Err(_) => format!("timed out after {:?}", self.callback_timeout),
            };

            if attempt >= self.max_retries {
                return StepResult::Failed(format!(
                    "{} (after {} attempts)",
                    retry_reason,
                    attempt + 1
                ));
            }
            let backoff = self.backoff_base * 2u32.pow(attempt);
            tracing::warn!(
                plugin = %callback.plugin_name,
                attempt = attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %retry_reason,
                "Callback attempt failed, backing off"
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    /// Seed the well-known `task.*` context keys from the completed
    /// upload's content fields.
    fn seed_context(&self, task: &mut UploadTask) -> DepotResult<()> {
        let missing = || {
            DepotError::Corruption(format!(
                "Task {} is processing without completed upload fields",
                task.task_id
            ))
        };
        let hash = task.content_hash.ok_or_else(missing)?;
        let total_size = task.total_size.ok_or_else(missing)?;
        let content_type = task.content_type.clone().ok_or_else(missing)?;
        let filename = task.filename.clone().ok_or_else(missing)?;
        let storage_path = task.storage_path.clone().ok_or_else(missing)?;

        task.context.insert(keys::TASK_ID, json!(task.task_id.to_string()));
        task.context.insert(keys::CONTENT_HASH, json!(hash.to_string()));
        task.context.insert(keys::TOTAL_SIZE, json!(total_size));
        task.context.insert(keys::CONTENT_TYPE, json!(content_type));
        task.context.insert(keys::FILENAME, json!(filename));
        task.context.insert(keys::STORAGE_PATH, json!(storage_path));
        Ok(())
    }

    /// Download the uploaded bytes into the work directory. A reference
    /// whose bytes are unreachable is corruption, not a transient miss.
    async fn materialize_working_copy(&self, task: &UploadTask) -> DepotResult<WorkingCopy> {
        let storage_path = task.storage_path.as_deref().ok_or_else(|| {
            DepotError::Corruption(format!("Task {} has no storage path", task.task_id))
        })?;
        let data = match self.storage.download(storage_path).await {
            Ok(data) => data,
            Err(StorageError::NotFound(path)) => {
                return Err(DepotError::Corruption(format!(
                    "Task {} references missing object {}",
                    task.task_id, path
                )))
            }
            Err(e) => return Err(e.into()),
        };

        tokio::fs::create_dir_all(&self.work_dir).await?;
        let path = self.work_dir.join(task.task_id.to_string());
        tokio::fs::write(&path, &data).await?;
        Ok(WorkingCopy { path })
    }

    async fn fail(
        &self,
        mut lease: TaskLease,
        failing_index: usize,
        reason: String,
    ) -> DepotResult<RunOutcome> {
        tracing::warn!(
            task_id = %lease.task.task_id,
            index = failing_index,
            reason = %reason,
            "Callback chain failed"
        );
        lease.task.mark_failed(&reason)?;
        self.tasks.save(&lease.task).await?;
        self.send(Notification::TaskFailed {
            task_id: lease.task.task_id,
            user_file_key: lease.task.user_file_key.clone(),
            reason: reason.clone(),
            failing_callback_index: Some(failing_index),
        })
        .await;
        Ok(RunOutcome::Failed { reason })
    }

    /// The chain ran out of callbacks: apply queued metadata updates,
    /// commit the derived-file batch, and report completion.
    async fn finish(&self, mut lease: TaskLease) -> DepotResult<RunOutcome> {
        let task_id = lease.task.task_id;

        let metadata_updates = lease.task.context.take_metadata_updates();
        if !metadata_updates.is_empty() {
            if let Some(mut reference) =
                self.files.find_reference(&lease.task.user_file_key).await?
            {
                for (key, value) in &metadata_updates {
                    match (key.as_str(), value.as_str()) {
                        ("filename", Some(filename)) => {
                            reference.filename = filename.to_string();
                        }
                        ("content_type", Some(content_type)) => {
                            reference.content_type = content_type.to_string();
                        }
                        _ => {
                            tracing::warn!(
                                task_id = %task_id,
                                key = %key,
                                "Dropping metadata update with no reference field"
                            );
                        }
                    }
                }
                self.files.insert_reference(&reference).await?;
            }
        }

        let activations = lease.task.context.take_pending_activations();
        if !activations.is_empty() {
            self.files.activate_batch(task_id, activations).await?;
        }

        lease.task = self.tasks.save(&lease.task).await?;

        let plugin_outputs = lease
            .task
            .context
            .values
            .iter()
            .filter(|(key, _)| !key.starts_with("task."))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        self.send(Notification::TaskCompleted {
            task_id,
            user_file_key: lease.task.user_file_key.clone(),
            storage_path: lease.task.storage_path.clone().unwrap_or_default(),
            content_hash: lease.task.content_hash.unwrap_or(depot_core::ContentHash(0)),
            total_size: lease.task.total_size.unwrap_or_default(),
            content_type: lease.task.content_type.clone().unwrap_or_default(),
            filename: lease.task.filename.clone().unwrap_or_default(),
            derived_files: lease.task.context.derived_files.clone(),
            plugin_outputs,
        })
        .await;

        tracing::info!(task_id = %task_id, "Callback chain completed");
        Ok(RunOutcome::Completed)
    }

    async fn send(&self, notification: Notification) {
        if let Err(e) = self.notifier.notify(notification).await {
            tracing::warn!(error = %e, "Notification delivery failed");
        }
    }
}
