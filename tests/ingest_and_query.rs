use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use uptrail::agent::{AgentClient, AgentDirectory, AgentError, AgentRegistry};
use uptrail::config::Config;
use uptrail::engine::{Collaborators, Engine};
use uptrail::model::*;
use uptrail::reaper;

use AvailabilityType::*;

// ── Test infrastructure ──────────────────────────────────────

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("uptrail_int_test_{}", ulid::Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let config = Config::from_lookup(|key| match key {
        "UPTRAIL_DATA_DIR" => Some(dir.join(name).display().to_string()),
        _ => None,
    });
    std::fs::create_dir_all(&config.data_dir).unwrap();
    config.wal_path()
}

struct ChannelAgentClient(mpsc::UnboundedSender<AgentId>);

#[async_trait]
impl AgentClient for ChannelAgentClient {
    async fn request_full_report(&self, agent_id: AgentId) -> Result<(), AgentError> {
        self.0
            .send(agent_id)
            .map_err(|e| AgentError::Unreachable(e.to_string()))
    }
}

struct Harness {
    engine: Arc<Engine>,
    agents: Arc<AgentRegistry>,
    requests: mpsc::UnboundedReceiver<AgentId>,
}

fn start(path: PathBuf) -> Harness {
    let (tx, requests) = mpsc::unbounded_channel();
    let agents = Arc::new(AgentRegistry::new());
    let collaborators = Collaborators {
        agents: agents.clone(),
        agent_client: Arc::new(ChannelAgentClient(tx)),
        agent_timeout: Duration::from_millis(500),
        ..Collaborators::standalone()
    };
    Harness {
        engine: Arc::new(Engine::new(path, collaborators).unwrap()),
        agents,
        requests,
    }
}

fn datums(items: &[(ResourceId, Ms, AvailabilityType)]) -> Vec<ReportDatum> {
    items
        .iter()
        .map(|&(rid, start, t)| ReportDatum::new(rid, start, t))
        .collect()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn agent_lifecycle_from_first_report_to_restart() {
    let path = test_wal_path("lifecycle");
    let mut h = start(path.clone());
    let engine = h.engine.clone();

    // Agent 1 monitors a platform (10) with two services (11, 12).
    engine
        .create_resource_at(ResourceInfo::new(10).with_agent(1), 0)
        .await
        .unwrap();
    for id in [11, 12] {
        engine
            .create_resource_at(
                ResourceInfo::new(id).with_parent(10).with_agent(1).with_type("service"),
                0,
            )
            .await
            .unwrap();
    }
    h.agents.register(1, 0);

    // First delta moves everything off UNKNOWN and asks for a full report.
    let outcome = engine
        .merge_availability_report(AvailabilityReport::changes_only(
            1,
            datums(&[(10, 1_000, Up), (11, 1_000, Up), (12, 1_000, Up)]),
        ))
        .await
        .unwrap();
    assert!(outcome.resync_requested);
    let requested = tokio::time::timeout(Duration::from_secs(1), h.requests.recv())
        .await
        .unwrap();
    assert_eq!(requested, Some(1));

    // The full report is authoritative and settles the state.
    let outcome = engine
        .merge_availability_report(AvailabilityReport::full(
            1,
            datums(&[(10, 2_000, Up), (11, 2_000, Up), (12, 5_000, Down)]),
        ))
        .await
        .unwrap();
    assert!(!outcome.resync_requested);

    let services = Context::AutoGroup {
        parent_id: 10,
        resource_type: "service".into(),
    };
    let points = engine
        .get_bucketed_availability(&services, 0, 10_000, 10, false)
        .await
        .unwrap();
    let types: Vec<_> = points.iter().map(|p| p.avail_type).collect();
    let mut expected = vec![Some(Unknown)];
    expected.extend([Some(Up); 4]);
    expected.extend([Some(Down); 5]);
    assert_eq!(types, expected);
    assert_eq!(engine.live_type(&services).await, Some(Down));

    // The agent goes quiet and is backfilled.
    let suspects = reaper::backfill_suspects_once(&engine, Ms::MAX / 2, 1_000).await;
    assert_eq!(suspects, 1);
    assert!(h.agents.is_agent_backfilled(1));
    for id in [10, 11, 12] {
        assert_eq!(engine.get_current_type(id), Unknown);
    }

    reaper::compact_if_needed(&engine, 0).await.unwrap();
    drop(h);
    drop(engine);

    // History survives a restart.
    let h = start(path);
    let restored = h
        .engine
        .get_bucketed_availability(&services, 0, 10_000, 10, false)
        .await
        .unwrap();
    assert_eq!(restored, points);
    assert_eq!(h.engine.get_current_type(12), Unknown);
}

#[tokio::test]
async fn parallel_agents_do_not_interfere() {
    let h = start(test_wal_path("parallel"));
    let engine = h.engine.clone();
    for id in 1..=40 {
        engine
            .create_resource_at(ResourceInfo::new(id).with_agent(id % 4), 0)
            .await
            .unwrap();
    }

    let reports = (0..4u64).flat_map(|agent| {
        (1..=25i64).map(move |round| {
            let data = (1..=40u64)
                .filter(|id| id % 4 == agent)
                .map(|id| {
                    let t = if round % 2 == 0 { Up } else { Down };
                    ReportDatum::new(id, round * 100, t)
                })
                .collect();
            AvailabilityReport::changes_only(agent, data)
        })
    });
    let results = futures::future::join_all(reports.map(|r| {
        let engine = engine.clone();
        async move { engine.merge_availability_report(r).await }
    }))
    .await;
    assert!(results.iter().all(|r| r.as_ref().is_ok_and(|o| o.accepted)));

    for id in 1..=40 {
        let history = engine.find_availability_within(id, 0, 10_000).await;
        assert!(history.iter().filter(|a| a.is_open()).count() == 1);
        for pair in history.windows(2) {
            assert_eq!(pair[0].end, Some(pair[1].start));
        }
        let current = engine.get_current_availability(id).await.unwrap();
        assert_eq!(engine.get_current_type(id), current.avail_type);
    }
}
