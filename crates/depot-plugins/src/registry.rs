//! Plugin registry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::plugin::Plugin;

/// Name-keyed registry of installed plugins. Registration happens at
/// bootstrap; lookups happen per callback execution.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: Arc<RwLock<HashMap<String, Arc<dyn Plugin>>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, plugin: Arc<dyn Plugin>) {
        let name = plugin.name().to_string();
        let mut plugins = self.plugins.write().await;
        if plugins.insert(name.clone(), plugin).is_some() {
            tracing::warn!(plugin = %name, "Plugin re-registered, previous entry replaced");
        } else {
            tracing::debug!(plugin = %name, "Plugin registered");
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.plugins.read().await.contains_key(name)
    }

    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}
