use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use uptrail::engine::{Collaborators, Engine};
use uptrail::model::*;

const MINUTE: Ms = 60_000;
const RESOURCES: u64 = 1_000;
const AGENTS: u64 = 20;

fn bench_wal_path() -> PathBuf {
    let dir = std::env::temp_dir().join("uptrail_bench");
    std::fs::create_dir_all(&dir).expect("create bench dir");
    let path = dir.join(format!("stress_{}.wal", ulid::Ulid::new()));
    let _ = std::fs::remove_file(&path);
    path
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// Agent `a` owns every resource whose id is `a` modulo `AGENTS`.
fn agent_resources(agent: AgentId) -> impl Iterator<Item = ResourceId> {
    (1..=RESOURCES).filter(move |id| id % AGENTS == agent)
}

fn flip(round: u64, id: ResourceId) -> AvailabilityType {
    if (round + id) % 3 == 0 {
        AvailabilityType::Down
    } else {
        AvailabilityType::Up
    }
}

async fn setup(engine: &Engine) {
    for id in 1..=RESOURCES {
        let info = ResourceInfo::new(id).with_agent(id % AGENTS);
        engine.create_resource_at(info, 0).await.expect("create resource");
    }
    println!("  created {RESOURCES} resources for {AGENTS} agents");
}

async fn phase1_full_reports(engine: &Engine) {
    let start = Instant::now();
    for agent in 0..AGENTS {
        let data = agent_resources(agent)
            .map(|id| ReportDatum::new(id, MINUTE, AvailabilityType::Up))
            .collect();
        engine
            .merge_availability_report(AvailabilityReport::full(agent, data))
            .await
            .expect("full report");
    }
    println!(
        "  {AGENTS} full reports over {RESOURCES} resources in {:.2}s",
        start.elapsed().as_secs_f64()
    );
}

async fn phase2_concurrent_deltas(engine: Arc<Engine>, rounds: u64) {
    let start = Instant::now();
    let mut handles = Vec::new();
    for agent in 0..AGENTS {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(rounds as usize);
            for round in 1..=rounds {
                let at = MINUTE * (round as Ms + 1);
                let data = agent_resources(agent)
                    .map(|id| ReportDatum::new(id, at, flip(round, id)))
                    .collect();
                let t = Instant::now();
                engine
                    .merge_availability_report(AvailabilityReport::changes_only(agent, data))
                    .await
                    .expect("delta report");
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut latencies = Vec::new();
    for h in handles {
        latencies.extend(h.await.expect("report task"));
    }
    let elapsed = start.elapsed();
    let datums = rounds * RESOURCES;
    println!(
        "  {AGENTS} agents x {rounds} rounds = {datums} datums in {:.2}s = {:.0} datums/sec",
        elapsed.as_secs_f64(),
        datums as f64 / elapsed.as_secs_f64()
    );
    print_latency("report merge", &mut latencies);
}

async fn phase3_queries_under_load(engine: Arc<Engine>, rounds: u64) {
    let writer = {
        let engine = engine.clone();
        tokio::spawn(async move {
            for round in 1..=rounds {
                let at = MINUTE * (1_000 + round as Ms);
                let data = (1..=RESOURCES)
                    .map(|id| ReportDatum::new(id, at, flip(round, id)))
                    .collect();
                let _ = engine
                    .merge_availability_report(AvailabilityReport::full(0, data))
                    .await;
            }
        })
    };

    let mut latencies = Vec::new();
    let range_end = MINUTE * (1_000 + rounds as Ms);
    for i in 0..200u64 {
        let context = Context::Resource(1 + i % RESOURCES);
        let t = Instant::now();
        let points = engine
            .get_bucketed_availability(&context, 0, range_end, 60, true)
            .await
            .expect("bucket query");
        latencies.push(t.elapsed());
        assert_eq!(points.len(), 60);
    }
    writer.await.expect("writer task");
    print_latency("bucketed query (60 buckets)", &mut latencies);
}

#[tokio::main]
async fn main() {
    let rounds: u64 = std::env::var("UPTRAIL_BENCH_ROUNDS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(50);

    println!("=== uptrail stress benchmark ===");
    let engine = Arc::new(
        Engine::new(bench_wal_path(), Collaborators::standalone()).expect("open engine"),
    );

    println!("[setup]");
    setup(&engine).await;

    println!("\n[phase 1] full reports");
    phase1_full_reports(&engine).await;

    println!("\n[phase 2] concurrent delta reports");
    phase2_concurrent_deltas(engine.clone(), rounds).await;

    println!("\n[phase 3] bucketed queries under write load");
    phase3_queries_under_load(engine.clone(), rounds).await;

    println!("\n=== benchmark complete ===");
}
