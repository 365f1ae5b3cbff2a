use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{now_ms, Engine, EngineError};
use crate::model::Ms;

/// Purge closed intervals older than `retention_ms` before `now`.
pub async fn purge_once(engine: &Engine, now: Ms, retention_ms: Ms) -> Result<usize, EngineError> {
    engine.purge_availabilities(now - retention_ms).await
}

/// Compact the WAL once it has grown past `threshold` appends. Returns
/// whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!(appends, "compacted availability log");
    Ok(true)
}

/// Backfill every agent that has been silent for longer than `suspect_ms`.
/// Returns how many agents were backfilled.
pub async fn backfill_suspects_once(engine: &Engine, now: Ms, suspect_ms: Ms) -> usize {
    let mut backfilled = 0;
    for agent_id in engine.agents.suspect_agents(now, suspect_ms) {
        match engine.backfill_agent(agent_id).await {
            Ok(_) => backfilled += 1,
            Err(e) => warn!(agent_id, error = %e, "agent backfill failed"),
        }
    }
    backfilled
}

/// Background task that enforces the retention window.
pub async fn run_purger(engine: Arc<Engine>, every: Duration, retention_ms: Ms) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = purge_once(&engine, now_ms(), retention_ms).await {
            warn!(error = %e, "purge failed");
        }
    }
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&engine, threshold).await {
            warn!(error = %e, "WAL compaction failed");
        }
    }
}

/// Background task that marks silent agents' resources UNKNOWN.
pub async fn run_backfiller(engine: Arc<Engine>, every: Duration, suspect_ms: Ms) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let n = backfill_suspects_once(&engine, now_ms(), suspect_ms).await;
        if n > 0 {
            debug!(agents = n, "backfill pass complete");
        }
    }
}
