//! Depot Store Library
//!
//! Persistence seams for the upload engine: the task store with version
//! checks and exclusive leases, the content-addressed physical file
//! store, the processed-message ledger, and the dedup engine built on
//! top of them. In-memory implementations back tests and single-node
//! deployments; durable backends implement the same traits.

pub mod dedup;
pub mod memory;
pub mod traits;

// Re-export commonly used types
pub use dedup::DedupEngine;
pub use memory::{InMemoryFileStore, InMemoryProcessedMessages, InMemoryTaskStore};
pub use traits::{PhysicalFileStore, ProcessedMessageStore, TaskLease, TaskStore};
