//! Parameter binding.
//!
//! Resolves a plugin's declared parameter schema against the callback's
//! named params and the chain context, producing a fully-bound
//! invocation. A missing required parameter is a validation error, which
//! is terminal for the chain rather than retried.

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::Value;
use uuid::Uuid;

use depot_core::models::{keys, CallbackSpec, ChainContext};
use depot_core::{DepotError, DepotResult};

use crate::plugin::{ParamKind, ParamSpec, Plugin, PluginInvocation};

/// Bind `plugin`'s parameter schema for one callback execution.
pub fn bind_invocation(
    plugin: &dyn Plugin,
    task_id: Uuid,
    callback: &CallbackSpec,
    context: &ChainContext,
) -> DepotResult<PluginInvocation> {
    let mut args = HashMap::new();
    let mut local_path = None;

    for spec in plugin.params() {
        let value = resolve(&spec, callback, context);
        match value {
            Some(value) => {
                if spec.kind == ParamKind::LocalFile {
                    let path = value.as_str().ok_or_else(|| {
                        DepotError::Validation(format!(
                            "Local file path for '{}' is not a string",
                            spec.name
                        ))
                    })?;
                    local_path = Some(PathBuf::from(path));
                }
                args.insert(spec.name, value);
            }
            None if spec.required => {
                return Err(DepotError::Validation(format!(
                    "Plugin '{}' is missing required parameter '{}'",
                    plugin.name(),
                    spec.name
                )));
            }
            None => {}
        }
    }

    Ok(PluginInvocation {
        task_id,
        args,
        local_path,
    })
}

fn resolve(spec: &ParamSpec, callback: &CallbackSpec, context: &ChainContext) -> Option<Value> {
    // An explicit callback param always wins, whatever the kind.
    if let Some(value) = callback.params.get(&spec.name) {
        return Some(value.clone());
    }
    let bound = match spec.kind {
        ParamKind::Config => None,
        ParamKind::LocalFile => context.get(keys::LOCAL_PATH).cloned(),
        ParamKind::TaskInfo => {
            let key = spec
                .source
                .clone()
                .unwrap_or_else(|| format!("task.{}", spec.name));
            context.get(&key).cloned()
        }
        ParamKind::PriorOutput => spec
            .source
            .as_deref()
            .and_then(|source| context.get(source))
            .cloned(),
    };
    bound.or_else(|| spec.default.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{PluginOutcome, PluginSuccess};
    use async_trait::async_trait;
    use serde_json::json;

    struct ResizePlugin;

    #[async_trait]
    impl Plugin for ResizePlugin {
        fn name(&self) -> &str {
            "resize"
        }

        fn params(&self) -> Vec<ParamSpec> {
            vec![
                ParamSpec::config("width"),
                ParamSpec::config("quality").with_default(json!(85)),
                ParamSpec::local_file("input"),
                ParamSpec::task_info("filename"),
                ParamSpec::prior_output("exif_rotation", "exif.rotation").optional(),
            ]
        }

        async fn execute(&self, _invocation: PluginInvocation) -> anyhow::Result<PluginOutcome> {
            Ok(PluginOutcome::Success(PluginSuccess::default()))
        }
    }

    fn seeded_context() -> ChainContext {
        let mut ctx = ChainContext::default();
        ctx.insert(keys::LOCAL_PATH, json!("/tmp/work/photo.png"));
        ctx.insert(keys::FILENAME, json!("photo.png"));
        ctx
    }

    #[test]
    fn test_binds_all_kinds() {
        let callback = CallbackSpec::new("resize").with_param("width", json!(640));
        let mut ctx = seeded_context();
        ctx.merge_outputs("exif", HashMap::from([("rotation".to_string(), json!(90))]));

        let invocation =
            bind_invocation(&ResizePlugin, Uuid::new_v4(), &callback, &ctx).unwrap();

        assert_eq!(invocation.arg_i64("width"), Some(640));
        assert_eq!(invocation.arg_i64("quality"), Some(85));
        assert_eq!(invocation.arg_str("filename"), Some("photo.png"));
        assert_eq!(invocation.arg_i64("exif_rotation"), Some(90));
        assert_eq!(
            invocation.local_path.as_deref(),
            Some(std::path::Path::new("/tmp/work/photo.png"))
        );
    }

    #[test]
    fn test_missing_required_is_validation_error() {
        let callback = CallbackSpec::new("resize");
        let ctx = seeded_context();

        let err = bind_invocation(&ResizePlugin, Uuid::new_v4(), &callback, &ctx).unwrap_err();
        assert!(matches!(err, DepotError::Validation(_)));
        assert!(err.to_string().contains("width"));
    }

    #[test]
    fn test_missing_optional_prior_output_is_omitted() {
        let callback = CallbackSpec::new("resize").with_param("width", json!(320));
        let ctx = seeded_context();

        let invocation =
            bind_invocation(&ResizePlugin, Uuid::new_v4(), &callback, &ctx).unwrap();
        assert!(invocation.arg("exif_rotation").is_none());
    }

    #[test]
    fn test_callback_param_overrides_context_binding() {
        let callback = CallbackSpec::new("resize")
            .with_param("width", json!(100))
            .with_param("filename", json!("renamed.png"));
        let ctx = seeded_context();

        let invocation =
            bind_invocation(&ResizePlugin, Uuid::new_v4(), &callback, &ctx).unwrap();
        assert_eq!(invocation.arg_str("filename"), Some("renamed.png"));
    }
}
