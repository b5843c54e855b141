//! Plugin trait and invocation types.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use depot_core::models::{DerivedFile, PendingActivation};

/// Where a declared parameter's value comes from at bind time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// A plain configuration value taken from the callback's params.
    Config,
    /// The path of the task's local working copy.
    LocalFile,
    /// A seeded task attribute from the chain context (`task.*` keys).
    TaskInfo,
    /// A prior plugin's output, addressed as `plugin.key`.
    PriorOutput,
}

/// One declared parameter of a plugin.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    pub default: Option<Value>,
    /// Context path to bind from. `TaskInfo` defaults to `task.{name}`
    /// when unset; `PriorOutput` must set it explicitly.
    pub source: Option<String>,
}

impl ParamSpec {
    pub fn config(name: impl Into<String>) -> Self {
        ParamSpec {
            name: name.into(),
            kind: ParamKind::Config,
            required: true,
            default: None,
            source: None,
        }
    }

    pub fn local_file(name: impl Into<String>) -> Self {
        ParamSpec {
            name: name.into(),
            kind: ParamKind::LocalFile,
            required: true,
            default: None,
            source: None,
        }
    }

    pub fn task_info(name: impl Into<String>) -> Self {
        ParamSpec {
            name: name.into(),
            kind: ParamKind::TaskInfo,
            required: true,
            default: None,
            source: None,
        }
    }

    pub fn prior_output(name: impl Into<String>, source: impl Into<String>) -> Self {
        ParamSpec {
            name: name.into(),
            kind: ParamKind::PriorOutput,
            required: true,
            default: None,
            source: Some(source.into()),
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.required = false;
        self.default = Some(default);
        self
    }

    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Fully-bound arguments for one plugin execution.
#[derive(Debug, Clone)]
pub struct PluginInvocation {
    pub task_id: Uuid,
    pub args: HashMap<String, Value>,
    /// Present when the plugin declared a `LocalFile` parameter.
    pub local_path: Option<PathBuf>,
}

impl PluginInvocation {
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    pub fn arg_str(&self, name: &str) -> Option<&str> {
        self.args.get(name).and_then(Value::as_str)
    }

    pub fn arg_i64(&self, name: &str) -> Option<i64> {
        self.args.get(name).and_then(Value::as_i64)
    }
}

/// Everything a successful plugin run hands back to the chain runner.
#[derive(Debug, Default)]
pub struct PluginSuccess {
    /// Output values, merged into the context namespaced by plugin name.
    pub outputs: HashMap<String, Value>,
    /// New files produced by this run, activated in one batch when the
    /// whole chain succeeds.
    pub derived: Vec<(DerivedFile, PendingActivation)>,
    /// File-record metadata updates, applied after the last callback.
    pub metadata_updates: HashMap<String, Value>,
}

/// The three ways a plugin run can end.
#[derive(Debug)]
pub enum PluginOutcome {
    Success(PluginSuccess),
    /// Retried up to the configured maximum when `retryable`; otherwise
    /// terminal for the whole chain.
    Failure { reason: String, retryable: bool },
    /// Not applicable to this input; the chain continues past it.
    Skip { reason: String },
}

impl PluginOutcome {
    pub fn success(outputs: HashMap<String, Value>) -> Self {
        PluginOutcome::Success(PluginSuccess {
            outputs,
            ..Default::default()
        })
    }

    pub fn failure(reason: impl Into<String>, retryable: bool) -> Self {
        PluginOutcome::Failure {
            reason: reason.into(),
            retryable,
        }
    }

    pub fn skip(reason: impl Into<String>) -> Self {
        PluginOutcome::Skip {
            reason: reason.into(),
        }
    }
}

/// A callback chain step implementation.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Registry key; callback specs reference plugins by this name.
    fn name(&self) -> &str;

    /// Declared parameter schema, resolved by the binder before execution.
    fn params(&self) -> Vec<ParamSpec>;

    /// Execute one bound invocation. An `Err` is an infrastructure
    /// failure and is treated as retryable; expected outcomes including
    /// failures go through `PluginOutcome`.
    async fn execute(&self, invocation: PluginInvocation) -> anyhow::Result<PluginOutcome>;
}
