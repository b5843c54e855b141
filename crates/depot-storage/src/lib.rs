//! Depot Storage Library
//!
//! Storage abstraction for Depot. Defines the `Storage` trait (direct
//! object operations plus the session-based multipart protocol) and the
//! local-filesystem backend used by tests and single-node deployments.
//!
//! # Storage keys
//!
//! Keys are relative paths under the backend root, e.g. `files/{file_key}`.
//! Keys must not contain `..` or a leading `/`.

pub mod local;
pub mod traits;

// Re-export commonly used types
pub use local::LocalStorage;
pub use traits::{
    CompletedPart, Storage, StorageError, StorageResult, UploadSession, UploadedObject,
};
