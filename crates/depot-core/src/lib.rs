//! Depot Core Library
//!
//! This crate provides the domain models, error types, configuration, and
//! content-hash computation shared across all Depot components. The upload
//! task aggregate and its state machine live here; execution (chain runner,
//! consumer pool) lives in `depot-engine`.

pub mod config;
pub mod dedup;
pub mod error;
pub mod models;

// Re-export commonly used types
pub use config::Config;
pub use dedup::ContentHash;
pub use error::{DepotError, DepotResult, LogLevel};
