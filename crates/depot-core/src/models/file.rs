use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dedup::ContentHash;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Created on first upload of a new hash, before a storage copy confirms.
    Pending,
    /// At least one storage copy confirmed; eligible for dedup binding.
    Active,
    /// Reference count reached zero; bytes await the garbage-collection sweep.
    Deleted,
}

impl Display for FileStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            FileStatus::Pending => write!(f, "pending"),
            FileStatus::Active => write!(f, "active"),
            FileStatus::Deleted => write!(f, "deleted"),
        }
    }
}

impl FromStr for FileStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FileStatus::Pending),
            "active" => Ok(FileStatus::Active),
            "deleted" => Ok(FileStatus::Deleted),
            _ => Err(anyhow::anyhow!("Invalid file status: {}", s)),
        }
    }
}

/// One physical location of the bytes for a content hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageCopy {
    pub node_id: String,
    pub path: String,
}

/// Content-addressed physical file record, keyed by content hash and
/// shared by every logical reference to the same bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalFile {
    pub content_hash: ContentHash,
    pub size: i64,
    pub content_type: String,
    pub ref_count: i64,
    pub status: FileStatus,
    pub copies: Vec<StorageCopy>,
    pub created_at: DateTime<Utc>,
}

impl PhysicalFile {
    pub fn new_pending(content_hash: ContentHash, size: i64, content_type: impl Into<String>) -> Self {
        PhysicalFile {
            content_hash,
            size,
            content_type: content_type.into(),
            ref_count: 0,
            status: FileStatus::Pending,
            copies: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Eligible for the garbage-collection sweep.
    pub fn is_collectable(&self) -> bool {
        self.ref_count <= 0 && self.status == FileStatus::Deleted
    }
}

/// A logical, caller-visible file handle bound to a physical file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReference {
    pub file_key: String,
    /// The upload task that produced this reference, if any (derived
    /// files activated mid-chain carry the producing task's id).
    pub task_id: Option<Uuid>,
    pub content_hash: ContentHash,
    pub size: i64,
    pub content_type: String,
    pub filename: String,
    pub created_at: DateTime<Utc>,
}

/// A derived file's provisional record, committed only after the whole
/// chain succeeds. Consumed in a single batch; never partially applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingActivation {
    pub file_key: String,
    pub content_hash: ContentHash,
    pub storage_path: String,
    pub node_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_pending_has_no_refs() {
        let file = PhysicalFile::new_pending(ContentHash(7), 100, "image/png");
        assert_eq!(file.ref_count, 0);
        assert_eq!(file.status, FileStatus::Pending);
        assert!(file.copies.is_empty());
        assert!(!file.is_collectable());
    }

    #[test]
    fn test_collectable_requires_deleted_and_zero_refs() {
        let mut file = PhysicalFile::new_pending(ContentHash(7), 100, "image/png");
        file.status = FileStatus::Deleted;
        assert!(file.is_collectable());

        file.ref_count = 1;
        assert!(!file.is_collectable());

        file.ref_count = 0;
        file.status = FileStatus::Active;
        assert!(!file.is_collectable());
    }

    #[test]
    fn test_file_status_round_trip() {
        for status in [FileStatus::Pending, FileStatus::Active, FileStatus::Deleted] {
            assert_eq!(status.to_string().parse::<FileStatus>().unwrap(), status);
        }
        assert!("gone".parse::<FileStatus>().is_err());
    }
}
