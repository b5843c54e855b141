//! Depot Engine Library
//!
//! The upload lifecycle engine: the upload service (task creation,
//! multipart upload, dedup binding, instant upload), the callback chain
//! runner, the message consumer pool with its two-tier idempotency
//! guard, and the bootstrap wiring that composes a running engine from
//! configuration.

pub mod bootstrap;
pub mod consumer;
pub mod filter;
pub mod notify;
pub mod runner;
pub mod service;
pub mod transport;

// Re-export commonly used types
pub use bootstrap::{init_tracing, Engine};
pub use consumer::{ConsumerPool, TaskConsumer};
pub use filter::{BloomExistenceFilter, ExistenceFilter};
pub use notify::{Notification, Notifier, RecordingNotifier, TracingNotifier};
pub use runner::{ChainRunner, RunOutcome};
pub use service::UploadService;
pub use transport::{Acknowledge, ChannelTransport, Delivery, MessageTransport};
