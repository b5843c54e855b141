//! Configuration module
//!
//! Environment-driven configuration, read once at process startup and
//! passed to the bootstrap by value. Collaborator selection (storage
//! backend, worker counts, retry and timeout budgets) happens here so the
//! rest of the system receives plain constructor arguments.

use std::env;

const DEFAULT_MAX_WORKERS: usize = 4;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_CALLBACK_TIMEOUT_SECS: u64 = 300;
const DEFAULT_CALLBACK_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_MESSAGE_DEDUP_TTL_SECS: u64 = 24 * 3600;
const DEFAULT_TASK_TTL_SECS: i64 = 24 * 3600;
const DEFAULT_FILTER_EXPECTED_INSERTIONS: usize = 1_000_000;
const DEFAULT_FILTER_FALSE_POSITIVE_RATE: f64 = 0.01;

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackendKind {
    Local,
}

/// Application configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Identifier of this node, recorded in storage copies and dead letters.
    pub node_id: String,
    pub environment: String,

    // Storage configuration
    pub storage_backend: StorageBackendKind,
    pub local_storage_path: String,
    pub local_storage_base_url: String,
    /// Directory for per-run working copies of uploaded files.
    pub work_dir: String,

    // Consumer pool configuration
    pub max_workers: usize,
    pub poll_interval_ms: u64,

    // Callback chain configuration
    pub callback_timeout_secs: u64,
    pub callback_max_retries: u32,
    pub retry_backoff_base_ms: u64,

    // Idempotency configuration
    pub message_dedup_ttl_secs: u64,
    pub filter_expected_insertions: usize,
    pub filter_false_positive_rate: f64,

    // Task lifecycle configuration
    pub task_ttl_secs: i64,
}

impl Config {
    /// Load configuration from environment variables (with `.env` support).
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let node_id = match env::var("DEPOT_NODE_ID") {
            Ok(id) => id,
            Err(_) => hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "depot-node".to_string()),
        };

        let storage_backend = match env::var("DEPOT_STORAGE_BACKEND").as_deref() {
            Ok("local") | Err(_) => StorageBackendKind::Local,
            Ok(other) => anyhow::bail!("Unknown storage backend: {}", other),
        };

        let filter_false_positive_rate = parse_env(
            "DEPOT_FILTER_FALSE_POSITIVE_RATE",
            DEFAULT_FILTER_FALSE_POSITIVE_RATE,
        );
        if !(filter_false_positive_rate > 0.0 && filter_false_positive_rate < 1.0) {
            anyhow::bail!(
                "DEPOT_FILTER_FALSE_POSITIVE_RATE must be in (0, 1), got {}",
                filter_false_positive_rate
            );
        }

        Ok(Config {
            node_id,
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            storage_backend,
            local_storage_path: env::var("DEPOT_LOCAL_STORAGE_PATH")
                .unwrap_or_else(|_| "./data/storage".to_string()),
            local_storage_base_url: env::var("DEPOT_LOCAL_STORAGE_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000/files".to_string()),
            work_dir: env::var("DEPOT_WORK_DIR").unwrap_or_else(|_| "./data/work".to_string()),
            max_workers: parse_env("DEPOT_MAX_WORKERS", DEFAULT_MAX_WORKERS),
            poll_interval_ms: parse_env("DEPOT_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS),
            callback_timeout_secs: parse_env(
                "DEPOT_CALLBACK_TIMEOUT_SECS",
                DEFAULT_CALLBACK_TIMEOUT_SECS,
            ),
            callback_max_retries: parse_env(
                "DEPOT_CALLBACK_MAX_RETRIES",
                DEFAULT_CALLBACK_MAX_RETRIES,
            ),
            retry_backoff_base_ms: parse_env(
                "DEPOT_RETRY_BACKOFF_BASE_MS",
                DEFAULT_RETRY_BACKOFF_BASE_MS,
            ),
            message_dedup_ttl_secs: parse_env(
                "DEPOT_MESSAGE_DEDUP_TTL_SECS",
                DEFAULT_MESSAGE_DEDUP_TTL_SECS,
            ),
            filter_expected_insertions: parse_env(
                "DEPOT_FILTER_EXPECTED_INSERTIONS",
                DEFAULT_FILTER_EXPECTED_INSERTIONS,
            ),
            filter_false_positive_rate,
            task_ttl_secs: parse_env("DEPOT_TASK_TTL_SECS", DEFAULT_TASK_TTL_SECS),
        })
    }

    pub fn is_production(&self) -> bool {
        matches!(self.environment.as_str(), "production" | "prod")
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_id: "depot-node".to_string(),
            environment: "development".to_string(),
            storage_backend: StorageBackendKind::Local,
            local_storage_path: "./data/storage".to_string(),
            local_storage_base_url: "http://localhost:3000/files".to_string(),
            work_dir: "./data/work".to_string(),
            max_workers: DEFAULT_MAX_WORKERS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            callback_timeout_secs: DEFAULT_CALLBACK_TIMEOUT_SECS,
            callback_max_retries: DEFAULT_CALLBACK_MAX_RETRIES,
            retry_backoff_base_ms: DEFAULT_RETRY_BACKOFF_BASE_MS,
            message_dedup_ttl_secs: DEFAULT_MESSAGE_DEDUP_TTL_SECS,
            filter_expected_insertions: DEFAULT_FILTER_EXPECTED_INSERTIONS,
            filter_false_positive_rate: DEFAULT_FILTER_FALSE_POSITIVE_RATE,
            task_ttl_secs: DEFAULT_TASK_TTL_SECS,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_sane() {
        let config = Config::default();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.callback_max_retries, 3);
        assert!(config.filter_false_positive_rate > 0.0);
        assert!(!config.is_production());
    }

    #[test]
    fn test_parse_env_falls_back_on_missing() {
        assert_eq!(parse_env("DEPOT_DOES_NOT_EXIST", 42u64), 42);
    }
}
