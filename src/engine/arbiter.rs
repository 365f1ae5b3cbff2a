//! Decides, per report, whether the server trusts the agent's view enough to
//! keep taking deltas or should ask it for a full report.

use crate::model::AvailabilityReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Reconcile,
    /// Drop the report untouched and ask for a full one.
    SkipAndResync,
}

/// A delta from an agent whose resources were backfilled in its absence
/// cannot be trusted: it only lists changes relative to a state the server
/// already overwrote.
pub fn admit(report: &AvailabilityReport, agent_backfilled: bool) -> Admission {
    if agent_backfilled && report.changes_only && !report.enablement {
        Admission::SkipAndResync
    } else {
        Admission::Reconcile
    }
}

/// After reconciling: only deltas ever trigger a resync. A full report is
/// itself the resync and enablement reports come from the server.
pub fn resync_requested(report: &AvailabilityReport, any_needs_full_report: bool) -> bool {
    any_needs_full_report && report.changes_only && !report.enablement
}
