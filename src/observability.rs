use std::net::SocketAddr;

use crate::model::AvailabilityReport;

// ── Ingestion ───────────────────────────────────────────────────

/// Counter: reports processed. Labels: kind, outcome.
pub const REPORTS_TOTAL: &str = "uptrail_reports_total";

/// Histogram: report merge latency in seconds. Labels: kind.
pub const REPORT_DURATION_SECONDS: &str = "uptrail_report_duration_seconds";

/// Counter: report datums. Labels: outcome.
pub const DATUMS_TOTAL: &str = "uptrail_datums_total";

/// Counter: timelines found broken and repaired. Labels: kind.
pub const ANOMALIES_TOTAL: &str = "uptrail_anomalies_total";

/// Counter: full reports requested from agents.
pub const FULL_REPORT_REQUESTS_TOTAL: &str = "uptrail_full_report_requests_total";

/// Counter: agents whose resources were backfilled to UNKNOWN.
pub const AGENTS_BACKFILLED_TOTAL: &str = "uptrail_agents_backfilled_total";

// ── Queries ─────────────────────────────────────────────────────

/// Histogram: bucketed query latency in seconds. Labels: context.
pub const QUERY_DURATION_SECONDS: &str = "uptrail_query_duration_seconds";

/// Counter: summaries that did not produce the requested bucket count.
pub const BUCKET_COUNT_MISMATCH_TOTAL: &str = "uptrail_bucket_count_mismatch_total";

// ── Storage ─────────────────────────────────────────────────────

/// Gauge: resources tracked.
pub const RESOURCES_ACTIVE: &str = "uptrail_resources_active";

/// Counter: intervals removed by retention purge.
pub const PURGED_INTERVALS_TOTAL: &str = "uptrail_purged_intervals_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "uptrail_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "uptrail_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for the kind of report, for metrics.
pub fn report_kind_label(report: &AvailabilityReport) -> &'static str {
    match (report.enablement, report.changes_only) {
        (true, _) => "enablement",
        (false, true) => "changes_only",
        (false, false) => "full",
    }
}
