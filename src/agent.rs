use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::model::{AgentId, Ms};

#[derive(Debug)]
pub enum AgentError {
    Unreachable(String),
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentError::Unreachable(e) => write!(f, "agent unreachable: {e}"),
        }
    }
}

impl std::error::Error for AgentError {}

/// Server-side bookkeeping of agent reporting.
pub trait AgentDirectory: Send + Sync {
    /// Whether the server filled in this agent's resources while it was silent.
    fn is_agent_backfilled(&self, agent_id: AgentId) -> bool;
    /// An agent that reports is alive again and no longer backfilled.
    fn record_report(&self, agent_id: AgentId, at: Ms);
    fn set_backfilled(&self, agent_id: AgentId, backfilled: bool);
    /// Agents not yet backfilled whose last report is older than `now - threshold`.
    fn suspect_agents(&self, now: Ms, threshold: Ms) -> Vec<AgentId>;
}

#[derive(Debug, Clone, Copy)]
struct AgentStatus {
    last_report: Ms,
    backfilled: bool,
}

/// In-memory `AgentDirectory`.
pub struct AgentRegistry {
    agents: DashMap<AgentId, AgentStatus>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
        }
    }

    /// Start tracking an agent as if it had just reported.
    pub fn register(&self, agent_id: AgentId, at: Ms) {
        self.agents.entry(agent_id).or_insert(AgentStatus {
            last_report: at,
            backfilled: false,
        });
    }

    pub fn last_report(&self, agent_id: AgentId) -> Option<Ms> {
        self.agents.get(&agent_id).map(|s| s.last_report)
    }
}

impl AgentDirectory for AgentRegistry {
    fn is_agent_backfilled(&self, agent_id: AgentId) -> bool {
        self.agents.get(&agent_id).is_some_and(|s| s.backfilled)
    }

    fn record_report(&self, agent_id: AgentId, at: Ms) {
        let mut status = self.agents.entry(agent_id).or_insert(AgentStatus {
            last_report: at,
            backfilled: false,
        });
        status.last_report = status.last_report.max(at);
        status.backfilled = false;
    }

    fn set_backfilled(&self, agent_id: AgentId, backfilled: bool) {
        if let Some(mut status) = self.agents.get_mut(&agent_id) {
            status.backfilled = backfilled;
        }
    }

    fn suspect_agents(&self, now: Ms, threshold: Ms) -> Vec<AgentId> {
        let mut suspects: Vec<AgentId> = self
            .agents
            .iter()
            .filter(|e| !e.backfilled && e.last_report < now - threshold)
            .map(|e| *e.key())
            .collect();
        suspects.sort_unstable();
        suspects
    }
}

/// Outbound calls to agents.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn request_full_report(&self, agent_id: AgentId) -> Result<(), AgentError>;
}

/// Client for deployments without an agent transport.
pub struct NoopAgentClient;

#[async_trait]
impl AgentClient for NoopAgentClient {
    async fn request_full_report(&self, agent_id: AgentId) -> Result<(), AgentError> {
        debug!(agent_id, "no agent transport, dropping full report request");
        Ok(())
    }
}

/// Ask an agent for a full report without waiting for it.
pub fn spawn_full_report_request(client: Arc<dyn AgentClient>, agent_id: AgentId, timeout: Duration) {
    metrics::counter!(crate::observability::FULL_REPORT_REQUESTS_TOTAL).increment(1);
    tokio::spawn(async move {
        match tokio::time::timeout(timeout, client.request_full_report(agent_id)).await {
            Ok(Ok(())) => debug!(agent_id, "requested full availability report"),
            Ok(Err(e)) => warn!(agent_id, error = %e, "full report request failed"),
            Err(_) => warn!(agent_id, ?timeout, "full report request timed out"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn report_clears_backfilled() {
        let registry = AgentRegistry::new();
        registry.register(1, 0);
        registry.set_backfilled(1, true);
        assert!(registry.is_agent_backfilled(1));

        registry.record_report(1, 500);
        assert!(!registry.is_agent_backfilled(1));
        assert_eq!(registry.last_report(1), Some(500));
    }

    #[test]
    fn unknown_agent_is_not_backfilled() {
        let registry = AgentRegistry::new();
        assert!(!registry.is_agent_backfilled(99));
        registry.set_backfilled(99, true);
        assert!(!registry.is_agent_backfilled(99));
    }

    #[test]
    fn suspects_are_silent_and_not_yet_backfilled() {
        let registry = AgentRegistry::new();
        registry.register(1, 0);
        registry.register(2, 9_000);
        registry.register(3, 0);
        registry.set_backfilled(3, true);

        assert_eq!(registry.suspect_agents(10_000, 5_000), vec![1]);
    }

    struct Slow(AtomicUsize);

    #[async_trait]
    impl AgentClient for Slow {
        async fn request_full_report(&self, _agent_id: AgentId) -> Result<(), AgentError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn request_is_bounded_by_timeout() {
        let client = Arc::new(Slow(AtomicUsize::new(0)));
        spawn_full_report_request(client.clone(), 1, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.0.load(Ordering::SeqCst), 1);
    }
}
