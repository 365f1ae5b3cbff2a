use std::sync::Arc;

use tracing::{info, warn};

use uptrail::config::Config;
use uptrail::engine::{Collaborators, Engine};
use uptrail::reaper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    uptrail::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let collaborators = Collaborators {
        agent_timeout: config.agent_timeout,
        ..Collaborators::standalone()
    };
    let engine = Arc::new(
        Engine::new(config.wal_path(), collaborators)?.with_chunk_size(config.chunk_size),
    );

    let tasks = [
        tokio::spawn(reaper::run_purger(
            engine.clone(),
            config.purge_interval,
            config.purge_retention_ms,
        )),
        tokio::spawn(reaper::run_compactor(engine.clone(), config.compact_threshold)),
        tokio::spawn(reaper::run_backfiller(
            engine.clone(),
            config.backfill_interval,
            config.agent_suspect_ms,
        )),
    ];

    info!("uptrail started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  resources: {}", engine.state.len());
    info!("  chunk_size: {}", config.chunk_size);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    shutdown_signal().await?;
    info!("shutdown signal received, stopping background tasks");
    for task in &tasks {
        task.abort();
    }

    // Leave a compact log behind so the next start replays quickly.
    if let Err(e) = engine.compact_wal().await {
        warn!(error = %e, "final WAL compaction failed");
    }

    info!("uptrail stopped");
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
