//! Domain models shared across Depot components.

pub mod context;
pub mod file;
pub mod message;
pub mod task;

pub use context::{keys, ChainContext, DerivedFile};
pub use file::{FileReference, FileStatus, PendingActivation, PhysicalFile, StorageCopy};
pub use message::{DeadLetter, TaskMessage};
pub use task::{CallbackSpec, TaskStatus, UploadCompletion, UploadPart, UploadTask};
