//! Engine composition.
//!
//! Builds a running engine from configuration: storage backend, stores,
//! transport, filter, plugin registry, chain runner, upload service, and
//! the consumer pool. Collaborators are trait objects so deployments can
//! swap any seam without touching the wiring.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use depot_core::Config;
use depot_plugins::{FileMetadataPlugin, PluginRegistry};
use depot_storage::{LocalStorage, Storage};
use depot_store::{
    DedupEngine, InMemoryFileStore, InMemoryProcessedMessages, InMemoryTaskStore,
    PhysicalFileStore, ProcessedMessageStore, TaskStore,
};

use crate::consumer::{ConsumerPool, TaskConsumer};
use crate::filter::{BloomExistenceFilter, ExistenceFilter};
use crate::notify::{Notifier, TracingNotifier};
use crate::runner::ChainRunner;
use crate::service::UploadService;
use crate::transport::{ChannelTransport, MessageTransport};

/// Initialize the tracing subscriber. JSON output in production, human
/// readable otherwise; `RUST_LOG` overrides the default filter.
pub fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.is_production() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// A fully wired engine.
pub struct Engine {
    pub service: Arc<UploadService>,
    pub runner: Arc<ChainRunner>,
    pub consumer: Arc<TaskConsumer>,
    pub registry: PluginRegistry,
    pub transport: ChannelTransport,
    config: Config,
}

impl Engine {
    /// Compose the engine from configuration with in-memory stores, the
    /// local storage backend, and the in-process transport.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let storage: Arc<dyn Storage> = Arc::new(
            LocalStorage::new(&config.local_storage_path, config.local_storage_base_url.clone())
                .await
                .context("Failed to initialize local storage")?,
        );

        let tasks: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let files: Arc<dyn PhysicalFileStore> = Arc::new(InMemoryFileStore::new());
        let ledger: Arc<dyn ProcessedMessageStore> = Arc::new(InMemoryProcessedMessages::new());
        let transport = ChannelTransport::new();
        let transport_dyn: Arc<dyn MessageTransport> = Arc::new(transport.clone());

        let filter: Arc<dyn ExistenceFilter> = Arc::new(
            BloomExistenceFilter::new(
                config.filter_expected_insertions,
                config.filter_false_positive_rate,
            )
            .context("Failed to build existence filter")?,
        );

        let dedup = Arc::new(DedupEngine::new(
            files.clone(),
            storage.clone(),
            config.node_id.clone(),
        ));

        let registry = PluginRegistry::new();
        registry.register(Arc::new(FileMetadataPlugin)).await;

        let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);

        let runner = Arc::new(ChainRunner::new(
            tasks.clone(),
            files.clone(),
            storage.clone(),
            registry.clone(),
            notifier,
            &config.work_dir,
            Duration::from_secs(config.callback_timeout_secs),
            config.callback_max_retries,
            Duration::from_millis(config.retry_backoff_base_ms),
        ));

        let consumer = Arc::new(TaskConsumer::new(
            tasks.clone(),
            ledger,
            filter.clone(),
            transport_dyn.clone(),
            runner.clone(),
            chrono::Duration::seconds(config.message_dedup_ttl_secs as i64),
            config.node_id.clone(),
        ));

        let service = Arc::new(UploadService::new(
            tasks,
            dedup,
            storage,
            transport_dyn,
            filter,
            config.node_id.clone(),
            config.task_ttl_secs,
        ));

        Ok(Engine {
            service,
            runner,
            consumer,
            registry,
            transport,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build the consumer pool and its shutdown handle.
    pub fn consumer_pool(&self) -> (ConsumerPool, mpsc::Sender<()>) {
        ConsumerPool::new(
            self.consumer.clone(),
            Arc::new(self.transport.clone()),
            self.config.max_workers,
            Duration::from_millis(self.config.poll_interval_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_engine_wires_from_config() {
        let storage_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();
        let config = Config {
            local_storage_path: storage_dir.path().to_string_lossy().into_owned(),
            work_dir: work_dir.path().to_string_lossy().into_owned(),
            poll_interval_ms: 10,
            ..Config::default()
        };

        let engine = Engine::from_config(config).await.unwrap();
        assert!(engine.registry.contains("file_metadata").await);

        let (pool, shutdown) = engine.consumer_pool();
        let handle = tokio::spawn(pool.run());
        shutdown.send(()).await.unwrap();
        handle.await.unwrap();
    }
}
