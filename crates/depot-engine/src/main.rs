//! Worker binary: runs the consumer pool plus the periodic sweeps
//! (expiry, retention, garbage collection) until interrupted.

use std::time::Duration;

use chrono::Utc;

use depot_core::Config;
use depot_engine::{init_tracing, Engine};

const SWEEP_INTERVAL_SECS: u64 = 60;
const SWEEP_BATCH: usize = 100;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config);
    tracing::info!(node_id = %config.node_id, "Starting depot worker");

    let retention = chrono::Duration::seconds(config.task_ttl_secs);
    let engine = Engine::from_config(config).await?;
    let (pool, shutdown_tx) = engine.consumer_pool();
    let pool_handle = tokio::spawn(pool.run());

    let sweeper = {
        let service = engine.service.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                let now = Utc::now();
                if let Err(e) = service.sweep_expired(now, SWEEP_BATCH).await {
                    tracing::warn!(error = %e, "Expiry sweep failed");
                }
                if let Err(e) = service.cleanup_finished(now - retention, SWEEP_BATCH).await {
                    tracing::warn!(error = %e, "Retention sweep failed");
                }
                if let Err(e) = service.collect_garbage(SWEEP_BATCH).await {
                    tracing::warn!(error = %e, "Garbage collection sweep failed");
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    sweeper.abort();
    let _ = shutdown_tx.send(()).await;
    pool_handle.await?;
    Ok(())
}
