use std::collections::HashMap;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dedup::ContentHash;
use crate::error::{DepotError, DepotResult};
use crate::models::context::ChainContext;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Processing,
    Completed,
    Failed,
    Aborted,
    Expired,
}

impl TaskStatus {
    /// Terminal states are never re-entered; any mutation of a terminal
    /// task fails with a state conflict.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Aborted | TaskStatus::Expired
        )
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Processing => write!(f, "processing"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Aborted => write!(f, "aborted"),
            TaskStatus::Expired => write!(f, "expired"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "aborted" => Ok(TaskStatus::Aborted),
            "expired" => Ok(TaskStatus::Expired),
            _ => Err(anyhow::anyhow!("Invalid task status: {}", s)),
        }
    }
}

/// One configured post-upload processing step: a plugin name plus its
/// named parameters. The list is chosen at task creation and never
/// mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallbackSpec {
    pub plugin_name: String,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

impl CallbackSpec {
    pub fn new(plugin_name: impl Into<String>) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            params: HashMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(name.into(), value);
        self
    }
}

/// One uploaded part of a multi-part upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadPart {
    pub part_number: i32,
    pub checksum: String,
    pub size: i64,
}

/// Content fields recorded when an upload completes.
#[derive(Debug, Clone)]
pub struct UploadCompletion {
    pub content_hash: ContentHash,
    pub total_size: i64,
    pub content_type: String,
    pub filename: String,
    pub storage_path: String,
}

/// The upload task aggregate: one upload's lifecycle record from creation
/// to terminal state. One writer at a time; the chain runner re-reads it
/// under an exclusive lock, everyone else goes through `save` which
/// enforces the version token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    pub task_id: Uuid,
    /// The caller-visible file handle this task will produce/bind.
    pub user_file_key: String,
    pub status: TaskStatus,
    pub session_id: Option<String>,
    pub node_id: Option<String>,
    pub storage_path: Option<String>,
    pub content_hash: Option<ContentHash>,
    pub total_size: Option<i64>,
    pub content_type: Option<String>,
    pub filename: Option<String>,
    pub parts: Vec<UploadPart>,
    pub callbacks: Vec<CallbackSpec>,
    /// Cursor into `callbacks`, persisted after every successful or
    /// skipped step so an interrupted chain resumes where it stopped.
    /// Always in `[0, callbacks.len()]`; equal to len only when exhausted.
    pub current_callback_index: usize,
    pub context: ChainContext,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, bumped by the store on every save.
    pub version: u64,
}

impl UploadTask {
    pub fn new(user_file_key: impl Into<String>, callbacks: Vec<CallbackSpec>, ttl_secs: i64) -> Self {
        let now = Utc::now();
        UploadTask {
            task_id: Uuid::new_v4(),
            user_file_key: user_file_key.into(),
            status: TaskStatus::Pending,
            session_id: None,
            node_id: None,
            storage_path: None,
            content_hash: None,
            total_size: None,
            content_type: None,
            filename: None,
            parts: Vec::new(),
            callbacks,
            current_callback_index: 0,
            context: ChainContext::default(),
            failure_reason: None,
            created_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
            completed_at: None,
            version: 0,
        }
    }

    fn guard(&self, operation: &'static str, allowed: &[TaskStatus]) -> DepotResult<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(DepotError::StateConflict {
                task_id: self.task_id,
                operation,
                status: self.status.to_string(),
            })
        }
    }

    /// Begin the upload: binds the storage session and node, PENDING → IN_PROGRESS.
    pub fn start_upload(
        &mut self,
        session_id: impl Into<String>,
        node_id: impl Into<String>,
        storage_path: impl Into<String>,
    ) -> DepotResult<()> {
        self.guard("start_upload", &[TaskStatus::Pending])?;
        self.session_id = Some(session_id.into());
        self.node_id = Some(node_id.into());
        self.storage_path = Some(storage_path.into());
        self.status = TaskStatus::InProgress;
        Ok(())
    }

    /// Record an uploaded part. Idempotent replace-by-partNumber: a part
    /// with an existing number overwrites the previous entry (last write
    /// wins), never duplicates. Recording the first part moves a PENDING
    /// task to IN_PROGRESS.
    pub fn record_part(&mut self, part: UploadPart) -> DepotResult<()> {
        self.guard("record_part", &[TaskStatus::Pending, TaskStatus::InProgress])?;
        if part.part_number < 1 {
            return Err(DepotError::Validation(format!(
                "Part number must be >= 1, got {}",
                part.part_number
            )));
        }
        match self
            .parts
            .iter_mut()
            .find(|p| p.part_number == part.part_number)
        {
            Some(existing) => *existing = part,
            None => self.parts.push(part),
        }
        if self.status == TaskStatus::Pending {
            self.status = TaskStatus::InProgress;
        }
        Ok(())
    }

    /// Complete the upload: populates content fields and decides the next
    /// state. With callbacks the task moves to PROCESSING and waits for
    /// the chain runner; without callbacks it completes directly (the only
    /// other way a task leaves PENDING).
    pub fn complete_upload(&mut self, completion: UploadCompletion) -> DepotResult<()> {
        match self.status {
            TaskStatus::InProgress => {}
            TaskStatus::Pending if self.callbacks.is_empty() => {}
            _ => {
                return Err(DepotError::StateConflict {
                    task_id: self.task_id,
                    operation: "complete_upload",
                    status: self.status.to_string(),
                })
            }
        }
        self.content_hash = Some(completion.content_hash);
        self.total_size = Some(completion.total_size);
        self.content_type = Some(completion.content_type);
        self.filename = Some(completion.filename);
        self.storage_path = Some(completion.storage_path);
        if self.callbacks.is_empty() {
            self.status = TaskStatus::Completed;
            self.completed_at = Some(Utc::now());
        } else {
            self.status = TaskStatus::Processing;
        }
        Ok(())
    }

    /// Advance the callback cursor past a finished (or skipped) step.
    /// Auto-completes the task when the last callback is passed.
    pub fn advance_callback(&mut self) -> DepotResult<()> {
        self.guard("advance_callback", &[TaskStatus::Processing])?;
        if self.current_callback_index >= self.callbacks.len() {
            return Err(DepotError::StateConflict {
                task_id: self.task_id,
                operation: "advance_callback",
                status: format!("cursor already at end ({})", self.current_callback_index),
            });
        }
        self.current_callback_index += 1;
        if self.current_callback_index == self.callbacks.len() {
            self.status = TaskStatus::Completed;
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn mark_completed(&mut self) -> DepotResult<()> {
        self.guard("mark_completed", &[TaskStatus::Processing])?;
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> DepotResult<()> {
        if self.status.is_terminal() {
            return Err(DepotError::StateConflict {
                task_id: self.task_id,
                operation: "mark_failed",
                status: self.status.to_string(),
            });
        }
        self.failure_reason = Some(reason.into());
        self.status = TaskStatus::Failed;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Abort an upload that has not entered processing. A chain already in
    /// flight is not preemptible; its terminal state wins.
    pub fn abort(&mut self) -> DepotResult<()> {
        self.guard("abort", &[TaskStatus::Pending, TaskStatus::InProgress])?;
        self.status = TaskStatus::Aborted;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Expiry sweep entry point. No-op on terminal tasks so the sweep can
    /// race completion without conflict errors.
    pub fn mark_expired(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = TaskStatus::Expired;
        self.completed_at = Some(Utc::now());
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && now > self.expires_at
    }

    /// The callback the cursor currently points at, if any remain.
    pub fn current_callback(&self) -> Option<&CallbackSpec> {
        self.callbacks.get(self.current_callback_index)
    }

    pub fn callbacks_exhausted(&self) -> bool {
        self.current_callback_index >= self.callbacks.len()
    }
}
