//! Built-in plugins.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::json;

use crate::plugin::{ParamSpec, Plugin, PluginInvocation, PluginOutcome};

/// Extracts basic file metadata from the working copy: size on disk and
/// the original filename. Skips when the working copy is unavailable
/// instead of failing the chain.
pub struct FileMetadataPlugin;

#[async_trait]
impl Plugin for FileMetadataPlugin {
    fn name(&self) -> &str {
        "file_metadata"
    }

    fn params(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::local_file("input").optional(),
            ParamSpec::task_info("filename").optional(),
        ]
    }

    async fn execute(&self, invocation: PluginInvocation) -> anyhow::Result<PluginOutcome> {
        let Some(path) = invocation.local_path.clone() else {
            return Ok(PluginOutcome::skip("no local working copy"));
        };

        let metadata = tokio::fs::metadata(&path).await?;
        let mut outputs = HashMap::new();
        outputs.insert("size_bytes".to_string(), json!(metadata.len()));
        if let Some(filename) = invocation.arg_str("filename") {
            outputs.insert("filename".to_string(), json!(filename));
        }
        if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
            outputs.insert("extension".to_string(), json!(extension));
        }

        Ok(PluginOutcome::success(outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_extracts_size_and_extension() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("photo.png");
        tokio::fs::write(&path, b"0123456789").await.unwrap();

        let invocation = PluginInvocation {
            task_id: Uuid::new_v4(),
            args: HashMap::from([(
                "filename".to_string(),
                Value::String("photo.png".into()),
            )]),
            local_path: Some(path),
        };

        let outcome = FileMetadataPlugin.execute(invocation).await.unwrap();
        let PluginOutcome::Success(success) = outcome else {
            panic!("expected success");
        };
        assert_eq!(success.outputs.get("size_bytes"), Some(&json!(10)));
        assert_eq!(success.outputs.get("extension"), Some(&json!("png")));
        assert_eq!(success.outputs.get("filename"), Some(&json!("photo.png")));
    }

    #[tokio::test]
    async fn test_skips_without_working_copy() {
        let invocation = PluginInvocation {
            task_id: Uuid::new_v4(),
            args: HashMap::new(),
            local_path: None,
        };
        let outcome = FileMetadataPlugin.execute(invocation).await.unwrap();
        assert!(matches!(outcome, PluginOutcome::Skip { .. }));
    }
}
