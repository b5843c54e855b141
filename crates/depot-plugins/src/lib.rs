//! Depot Plugins Library
//!
//! The callback plugin system: the `Plugin` trait with its typed
//! parameter schema, the registry keyed by plugin name, and the binder
//! that resolves parameter schemas against callback params and chain
//! context before each invocation.

pub mod binder;
pub mod builtin;
pub mod plugin;
pub mod registry;

// Re-export commonly used types
pub use binder::bind_invocation;
pub use builtin::FileMetadataPlugin;
pub use plugin::{ParamKind, ParamSpec, Plugin, PluginInvocation, PluginOutcome, PluginSuccess};
pub use registry::PluginRegistry;
