//! Completion and failure notifications.
//!
//! Emitted after the owning task state is durably saved, so a consumer
//! acting on a notification always observes the terminal state. Delivery
//! failures are logged and never fail the task.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use depot_core::models::DerivedFile;
use depot_core::ContentHash;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    TaskCompleted {
        task_id: Uuid,
        user_file_key: String,
        storage_path: String,
        content_hash: ContentHash,
        total_size: i64,
        content_type: String,
        filename: String,
        derived_files: Vec<DerivedFile>,
        plugin_outputs: HashMap<String, serde_json::Value>,
    },
    TaskFailed {
        task_id: Uuid,
        user_file_key: String,
        reason: String,
        failing_callback_index: Option<usize>,
    },
    DerivedFilesAdded {
        task_id: Uuid,
        source_file_key: String,
        files: Vec<DerivedFile>,
    },
}

/// Notification sink seam.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> anyhow::Result<()>;
}

/// Default sink: structured log events only.
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: Notification) -> anyhow::Result<()> {
        match &notification {
            Notification::TaskCompleted {
                task_id,
                user_file_key,
                ..
            } => {
                tracing::info!(task_id = %task_id, file_key = %user_file_key, "Task completed");
            }
            Notification::TaskFailed {
                task_id, reason, ..
            } => {
                tracing::warn!(task_id = %task_id, reason = %reason, "Task failed");
            }
            Notification::DerivedFilesAdded { task_id, files, .. } => {
                tracing::info!(task_id = %task_id, count = files.len(), "Derived files added");
            }
        }
        Ok(())
    }
}

/// Test sink collecting notifications in order.
#[derive(Default)]
pub struct RecordingNotifier {
    events: tokio::sync::Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<Notification> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) -> anyhow::Result<()> {
        self.events.lock().await.push(notification);
        Ok(())
    }
}
