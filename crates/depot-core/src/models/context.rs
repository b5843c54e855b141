//! Chain context: the mutable key/value scratch space that travels with a
//! task through its callback chain. Plugin outputs, queued metadata
//! updates, derived-file records, and the pending-activation ledger all
//! live here so a checkpointed task carries everything needed to resume.
//!
//! The context is owned by the running task and passed by explicit
//! ownership; it is never aliased across threads.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::file::PendingActivation;

/// Well-known context keys seeded by the chain runner before the first
/// callback executes. Plugins bind task-info parameters against these.
pub mod keys {
    pub const TASK_ID: &str = "task.id";
    pub const CONTENT_HASH: &str = "task.content_hash";
    pub const TOTAL_SIZE: &str = "task.total_size";
    pub const CONTENT_TYPE: &str = "task.content_type";
    pub const FILENAME: &str = "task.filename";
    pub const STORAGE_PATH: &str = "task.storage_path";
    pub const LOCAL_PATH: &str = "task.local_path";
}

/// A new file produced by a plugin mid-chain (e.g. a thumbnail), linked
/// to the source upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DerivedFile {
    pub file_key: String,
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    pub storage_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainContext {
    /// Scratch values: execution metadata plus merged plugin outputs.
    #[serde(default)]
    pub values: HashMap<String, serde_json::Value>,
    /// Derived files recorded by plugins, reported in the completion
    /// notification.
    #[serde(default)]
    pub derived_files: Vec<DerivedFile>,
    /// Derived files awaiting activation; applied as a single batch when
    /// the whole chain succeeds, never partially.
    #[serde(default)]
    pub pending_activations: Vec<PendingActivation>,
    /// File-record metadata updates queued by plugins (e.g. a rename),
    /// applied after the last callback.
    #[serde(default)]
    pub metadata_updates: HashMap<String, serde_json::Value>,
}

impl ChainContext {
    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// Merge a plugin's output map into the scratch space, namespaced by
    /// plugin name so later callbacks can bind to earlier outputs without
    /// key collisions.
    pub fn merge_outputs(
        &mut self,
        plugin_name: &str,
        outputs: HashMap<String, serde_json::Value>,
    ) {
        for (key, value) in outputs {
            self.values.insert(format!("{}.{}", plugin_name, key), value);
        }
    }

    /// Look up a prior plugin's output by `plugin.key` path.
    pub fn plugin_output(&self, plugin_name: &str, key: &str) -> Option<&serde_json::Value> {
        self.values.get(&format!("{}.{}", plugin_name, key))
    }

    pub fn add_derived_file(&mut self, file: DerivedFile, activation: PendingActivation) {
        self.derived_files.push(file);
        self.pending_activations.push(activation);
    }

    pub fn queue_metadata_update(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata_updates.insert(key.into(), value);
    }

    /// Drain the pending-activation ledger for batch application.
    pub fn take_pending_activations(&mut self) -> Vec<PendingActivation> {
        std::mem::take(&mut self.pending_activations)
    }

    pub fn take_metadata_updates(&mut self) -> HashMap<String, serde_json::Value> {
        std::mem::take(&mut self.metadata_updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::ContentHash;
    use serde_json::json;

    #[test]
    fn test_merge_outputs_namespaces_by_plugin() {
        let mut ctx = ChainContext::default();
        let mut outputs = HashMap::new();
        outputs.insert("width".to_string(), json!(640));
        ctx.merge_outputs("thumbnail", outputs);

        assert_eq!(ctx.plugin_output("thumbnail", "width"), Some(&json!(640)));
        assert_eq!(ctx.get("thumbnail.width"), Some(&json!(640)));
        assert!(ctx.plugin_output("rename", "width").is_none());
    }

    #[test]
    fn test_take_pending_activations_drains() {
        let mut ctx = ChainContext::default();
        ctx.add_derived_file(
            DerivedFile {
                file_key: "thumb-1".into(),
                filename: "photo_thumb.png".into(),
                content_type: "image/png".into(),
                size: 128,
                storage_path: "files/thumb-1".into(),
            },
            PendingActivation {
                file_key: "thumb-1".into(),
                content_hash: ContentHash(1),
                storage_path: "files/thumb-1".into(),
                node_id: "node-a".into(),
            },
        );

        assert_eq!(ctx.derived_files.len(), 1);
        let taken = ctx.take_pending_activations();
        assert_eq!(taken.len(), 1);
        assert!(ctx.pending_activations.is_empty());
        // Derived-file records stay for the completion notification.
        assert_eq!(ctx.derived_files.len(), 1);
    }

    #[test]
    fn test_context_survives_serde_round_trip() {
        let mut ctx = ChainContext::default();
        ctx.insert(keys::FILENAME, json!("a.png"));
        ctx.queue_metadata_update("filename", json!("b.png"));

        let encoded = serde_json::to_string(&ctx).unwrap();
        let decoded: ChainContext = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.get(keys::FILENAME), Some(&json!("a.png")));
        assert_eq!(decoded.metadata_updates.get("filename"), Some(&json!("b.png")));
    }
}
