//! Storage abstraction trait
//!
//! All storage backends must implement `Storage`. The engine works
//! against this trait only; concrete SDK adapters stay outside the core.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Upload session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid part: {0}")]
    InvalidPart(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for depot_core::DepotError {
    fn from(err: StorageError) -> Self {
        use depot_core::DepotError;
        match err {
            StorageError::NotFound(key) => DepotError::NotFound(format!("Object {}", key)),
            StorageError::SessionNotFound(id) => {
                DepotError::NotFound(format!("Upload session {}", id))
            }
            StorageError::InvalidKey(key) => {
                DepotError::Validation(format!("Invalid storage key: {}", key))
            }
            StorageError::InvalidPart(msg) => DepotError::Validation(msg),
            StorageError::ConfigError(msg) => {
                DepotError::Internal(anyhow::anyhow!("Storage configuration: {}", msg))
            }
            other => DepotError::TransientIo(other.to_string()),
        }
    }
}

/// Result of a direct (non-multipart) upload.
#[derive(Debug, Clone)]
pub struct UploadedObject {
    pub path: String,
    pub checksum: String,
    pub size: u64,
}

/// One finished part handed to `UploadSession::complete`. Parts may
/// arrive in any order; completion sorts by part number before finalizing.
#[derive(Debug, Clone)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
}

/// A session-based multipart upload in progress.
#[async_trait]
pub trait UploadSession: Send + Sync {
    /// Backend session identifier, recorded on the task for resumption.
    fn session_id(&self) -> &str;

    /// Upload one part; returns the part's etag.
    async fn upload_part(&self, part_number: i32, data: Vec<u8>) -> StorageResult<String>;

    /// Finalize the upload from the given parts. Sorts by part number;
    /// returns the final storage key.
    async fn complete(&self, parts: Vec<CompletedPart>) -> StorageResult<String>;

    /// Abort the session and discard staged parts. Idempotent: aborting
    /// an already-aborted or completed session is not an error.
    async fn abort(&self) -> StorageResult<()>;
}

/// Storage abstraction trait
#[async_trait]
pub trait Storage: Send + Sync {
    /// Upload a complete object to `storage_key`.
    async fn upload(
        &self,
        storage_key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> StorageResult<UploadedObject>;

    /// Download an object by its storage key.
    async fn download(&self, storage_key: &str) -> StorageResult<Vec<u8>>;

    /// Delete an object by its storage key.
    async fn delete(&self, storage_key: &str) -> StorageResult<()>;

    /// Check whether an object exists.
    async fn exists(&self, storage_key: &str) -> StorageResult<bool>;

    /// Generate a presigned/temporary URL for direct access.
    async fn presigned_url(
        &self,
        storage_key: &str,
        expires_in: Duration,
    ) -> StorageResult<String>;

    /// Begin a multipart upload targeting `storage_key`.
    async fn begin_upload(&self, storage_key: &str) -> StorageResult<Box<dyn UploadSession>>;

    /// Resume a previously-begun multipart upload by session id.
    async fn resume_upload(
        &self,
        storage_key: &str,
        session_id: &str,
    ) -> StorageResult<Box<dyn UploadSession>>;
}
