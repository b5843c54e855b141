//! Local filesystem storage implementation.
//!
//! Multipart sessions stage parts under `.staging/{session_id}/` inside
//! the storage root; completion concatenates the parts in part-number
//! order into the final key and removes the staging directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use depot_core::ContentHash;

use crate::traits::{
    CompletedPart, Storage, StorageError, StorageResult, UploadSession, UploadedObject,
};

const STAGING_DIR: &str = ".staging";

/// Local filesystem storage backend.
#[derive(Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
    base_url: String,
}

impl LocalStorage {
    /// Create a new LocalStorage rooted at `base_path`. The directory is
    /// created if missing.
    pub async fn new(base_path: impl Into<PathBuf>, base_url: String) -> StorageResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await.map_err(|e| {
            StorageError::ConfigError(format!(
                "Failed to create storage directory {}: {}",
                base_path.display(),
                e
            ))
        })?;
        Ok(LocalStorage {
            base_path,
            base_url,
        })
    }

    /// Convert a storage key to a filesystem path, rejecting traversal.
    fn key_to_path(&self, storage_key: &str) -> StorageResult<PathBuf> {
        if storage_key.is_empty()
            || storage_key.contains("..")
            || storage_key.starts_with('/')
        {
            return Err(StorageError::InvalidKey(storage_key.to_string()));
        }
        Ok(self.base_path.join(storage_key))
    }

    fn staging_dir(&self, session_id: &str) -> PathBuf {
        self.base_path.join(STAGING_DIR).join(session_id)
    }

    async fn ensure_parent_dir(path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn upload(
        &self,
        storage_key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> StorageResult<UploadedObject> {
        let path = self.key_to_path(storage_key)?;
        Self::ensure_parent_dir(&path).await?;

        let checksum = ContentHash::of_bytes(&data).to_string();
        let size = data.len() as u64;

        let mut file = fs::File::create(&path)
            .await
            .map_err(|e| StorageError::UploadFailed(format!("{}: {}", path.display(), e)))?;
        file.write_all(&data)
            .await
            .map_err(|e| StorageError::UploadFailed(format!("{}: {}", path.display(), e)))?;
        file.flush().await?;

        tracing::debug!(
            storage_key = %storage_key,
            size = size,
            content_type = %content_type,
            "Object uploaded to local storage"
        );

        Ok(UploadedObject {
            path: storage_key.to_string(),
            checksum,
            size,
        })
    }

    async fn download(&self, storage_key: &str) -> StorageResult<Vec<u8>> {
        let path = self.key_to_path(storage_key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(storage_key.to_string()))
            }
            Err(e) => Err(StorageError::DownloadFailed(format!(
                "{}: {}",
                storage_key, e
            ))),
        }
    }

    async fn delete(&self, storage_key: &str) -> StorageResult<()> {
        let path = self.key_to_path(storage_key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(storage_key.to_string()))
            }
            Err(e) => Err(StorageError::DeleteFailed(format!("{}: {}", storage_key, e))),
        }
    }

    async fn exists(&self, storage_key: &str) -> StorageResult<bool> {
        let path = self.key_to_path(storage_key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn presigned_url(
        &self,
        storage_key: &str,
        expires_in: Duration,
    ) -> StorageResult<String> {
        self.key_to_path(storage_key)?;
        let expires_at = chrono::Utc::now() + chrono::Duration::seconds(expires_in.as_secs() as i64);
        Ok(format!(
            "{}/{}?expires_at={}",
            self.base_url.trim_end_matches('/'),
            storage_key,
            expires_at.timestamp()
        ))
    }

    async fn begin_upload(&self, storage_key: &str) -> StorageResult<Box<dyn UploadSession>> {
        let target = self.key_to_path(storage_key)?;
        let session_id = Uuid::new_v4().to_string();
        let staging = self.staging_dir(&session_id);
        fs::create_dir_all(&staging).await?;

        tracing::debug!(
            storage_key = %storage_key,
            session_id = %session_id,
            "Multipart upload session started"
        );

        Ok(Box::new(LocalUploadSession {
            session_id,
            staging,
            target,
            target_key: storage_key.to_string(),
        }))
    }

    async fn resume_upload(
        &self,
        storage_key: &str,
        session_id: &str,
    ) -> StorageResult<Box<dyn UploadSession>> {
        let target = self.key_to_path(storage_key)?;
        let staging = self.staging_dir(session_id);
        if !fs::try_exists(&staging).await? {
            return Err(StorageError::SessionNotFound(session_id.to_string()));
        }
        Ok(Box::new(LocalUploadSession {
            session_id: session_id.to_string(),
            staging,
            target,
            target_key: storage_key.to_string(),
        }))
    }
}

struct LocalUploadSession {
    session_id: String,
    staging: PathBuf,
    target: PathBuf,
    target_key: String,
}

impl LocalUploadSession {
    fn part_path(&self, part_number: i32) -> PathBuf {
        self.staging.join(format!("part-{:05}", part_number))
    }
}

#[async_trait]
impl UploadSession for LocalUploadSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn upload_part(&self, part_number: i32, data: Vec<u8>) -> StorageResult<String> {
        if part_number < 1 {
            return Err(StorageError::InvalidPart(format!(
                "part number must be >= 1, got {}",
                part_number
            )));
        }
        if !fs::try_exists(&self.staging).await? {
            return Err(StorageError::SessionNotFound(self.session_id.clone()));
        }
        let etag = ContentHash::of_bytes(&data).to_string();
        // Replace-by-part-number: re-uploading a part overwrites it.
        fs::write(self.part_path(part_number), &data).await?;
        Ok(etag)
    }

    async fn complete(&self, mut parts: Vec<CompletedPart>) -> StorageResult<String> {
        if parts.is_empty() {
            return Err(StorageError::InvalidPart("no parts to complete".to_string()));
        }
        if !fs::try_exists(&self.staging).await? {
            return Err(StorageError::SessionNotFound(self.session_id.clone()));
        }

        parts.sort_by_key(|p| p.part_number);

        LocalStorage::ensure_parent_dir(&self.target).await?;
        let mut out = fs::File::create(&self.target)
            .await
            .map_err(|e| StorageError::UploadFailed(format!("{}: {}", self.target_key, e)))?;

        for part in &parts {
            let data = match fs::read(self.part_path(part.part_number)).await {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StorageError::InvalidPart(format!(
                        "part {} was never uploaded",
                        part.part_number
                    )))
                }
                Err(e) => return Err(e.into()),
            };
            let actual = ContentHash::of_bytes(&data).to_string();
            if actual != part.etag {
                return Err(StorageError::InvalidPart(format!(
                    "part {} etag mismatch: expected {}, staged {}",
                    part.part_number, part.etag, actual
                )));
            }
            out.write_all(&data).await?;
        }
        out.flush().await?;

        fs::remove_dir_all(&self.staging).await.ok();

        tracing::debug!(
            storage_key = %self.target_key,
            session_id = %self.session_id,
            parts = parts.len(),
            "Multipart upload completed"
        );

        Ok(self.target_key.clone())
    }

    async fn abort(&self) -> StorageResult<()> {
        match fs::remove_dir_all(&self.staging).await {
            Ok(()) => Ok(()),
            // Already aborted or completed; abort stays idempotent.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn storage() -> (TempDir, LocalStorage) {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path(), "http://localhost:3000/files".to_string())
            .await
            .unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_upload_download_round_trip() {
        let (_dir, storage) = storage().await;
        let uploaded = storage
            .upload("files/a.txt", b"hello depot".to_vec(), "text/plain")
            .await
            .unwrap();
        assert_eq!(uploaded.size, 11);
        assert_eq!(
            uploaded.checksum,
            ContentHash::of_bytes(b"hello depot").to_string()
        );

        let data = storage.download("files/a.txt").await.unwrap();
        assert_eq!(data, b"hello depot");
        assert!(storage.exists("files/a.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_download_missing_is_not_found() {
        let (_dir, storage) = storage().await;
        let err = storage.download("files/missing").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_key_traversal_rejected() {
        let (_dir, storage) = storage().await;
        assert!(matches!(
            storage.download("../etc/passwd").await.unwrap_err(),
            StorageError::InvalidKey(_)
        ));
        assert!(matches!(
            storage.download("/abs/path").await.unwrap_err(),
            StorageError::InvalidKey(_)
        ));
    }

    #[tokio::test]
    async fn test_delete_removes_object() {
        let (_dir, storage) = storage().await;
        storage
            .upload("files/b.txt", b"x".to_vec(), "text/plain")
            .await
            .unwrap();
        storage.delete("files/b.txt").await.unwrap();
        assert!(!storage.exists("files/b.txt").await.unwrap());
        assert!(matches!(
            storage.delete("files/b.txt").await.unwrap_err(),
            StorageError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_multipart_completes_in_part_order() {
        let (_dir, storage) = storage().await;
        let session = storage.begin_upload("files/multi.bin").await.unwrap();

        // Upload out of order; completion must sort by part number.
        let etag2 = session.upload_part(2, b"world".to_vec()).await.unwrap();
        let etag1 = session.upload_part(1, b"hello ".to_vec()).await.unwrap();

        let key = session
            .complete(vec![
                CompletedPart {
                    part_number: 2,
                    etag: etag2,
                },
                CompletedPart {
                    part_number: 1,
                    etag: etag1,
                },
            ])
            .await
            .unwrap();

        assert_eq!(key, "files/multi.bin");
        let data = storage.download("files/multi.bin").await.unwrap();
        assert_eq!(data, b"hello world");
    }

    #[tokio::test]
    async fn test_multipart_etag_mismatch_rejected() {
        let (_dir, storage) = storage().await;
        let session = storage.begin_upload("files/bad.bin").await.unwrap();
        session.upload_part(1, b"data".to_vec()).await.unwrap();

        let err = session
            .complete(vec![CompletedPart {
                part_number: 1,
                etag: "0000000000000000".to_string(),
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidPart(_)));
    }

    #[tokio::test]
    async fn test_resume_session_sees_staged_parts() {
        let (_dir, storage) = storage().await;
        let session = storage.begin_upload("files/resume.bin").await.unwrap();
        let session_id = session.session_id().to_string();
        let etag1 = session.upload_part(1, b"aa".to_vec()).await.unwrap();
        drop(session);

        let resumed = storage
            .resume_upload("files/resume.bin", &session_id)
            .await
            .unwrap();
        let etag2 = resumed.upload_part(2, b"bb".to_vec()).await.unwrap();
        resumed
            .complete(vec![
                CompletedPart {
                    part_number: 1,
                    etag: etag1,
                },
                CompletedPart {
                    part_number: 2,
                    etag: etag2,
                },
            ])
            .await
            .unwrap();
        assert_eq!(
            storage.download("files/resume.bin").await.unwrap(),
            b"aabb"
        );
    }

    #[tokio::test]
    async fn test_abort_is_idempotent() {
        let (_dir, storage) = storage().await;
        let session = storage.begin_upload("files/aborted.bin").await.unwrap();
        session.upload_part(1, b"x".to_vec()).await.unwrap();
        session.abort().await.unwrap();
        session.abort().await.unwrap();

        let err = session.upload_part(2, b"y".to_vec()).await.unwrap_err();
        assert!(matches!(err, StorageError::SessionNotFound(_)));
        assert!(!storage.exists("files/aborted.bin").await.unwrap());
    }

    #[tokio::test]
    async fn test_resume_unknown_session_fails() {
        let (_dir, storage) = storage().await;
        let result = storage.resume_upload("files/x.bin", "no-such-session").await;
        assert!(matches!(result, Err(StorageError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_presigned_url_carries_expiry() {
        let (_dir, storage) = storage().await;
        let url = storage
            .presigned_url("files/a.txt", Duration::from_secs(600))
            .await
            .unwrap();
        assert!(url.starts_with("http://localhost:3000/files/files/a.txt?expires_at="));
    }
}
