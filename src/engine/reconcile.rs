//! Folds one reported status change into one resource's timeline.
//!
//! A datum at or after the open interval's start moves the timeline forward.
//! A datum before it rewrites history in place: it extends a neighbour of the
//! same type, retypes the interval it lands on, or splits it. Afterwards the
//! timeline is contiguous again and adjacent intervals of equal type are merged.

use tracing::{debug, warn};

use crate::model::*;
use crate::observability;

use super::store::TimelineTxn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatumKind {
    /// The timeline already said this.
    Unchanged,
    /// Current state moved forward.
    Advanced,
    /// History before the current state was rewritten.
    Backfilled,
    /// Dropped by the disabled guard.
    Suppressed,
}

impl DatumKind {
    pub fn label(&self) -> &'static str {
        match self {
            DatumKind::Unchanged => "unchanged",
            DatumKind::Advanced => "advanced",
            DatumKind::Backfilled => "backfilled",
            DatumKind::Suppressed => "suppressed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatumOutcome {
    pub kind: DatumKind,
    /// The interval now carrying the datum's type, when the timeline changed.
    pub changed: Option<Availability>,
    /// The server is unsure of the agent's view and wants a full report.
    pub needs_full_report: bool,
}

impl DatumOutcome {
    fn unchanged(needs_full_report: bool) -> Self {
        Self {
            kind: DatumKind::Unchanged,
            changed: None,
            needs_full_report,
        }
    }

    fn suppressed() -> Self {
        Self {
            kind: DatumKind::Suppressed,
            changed: None,
            needs_full_report: false,
        }
    }
}

/// Reconcile one datum `(start, reported)` against the timeline under `txn`.
///
/// `enablement` marks datums from an enablement report: only those (and only
/// with UNKNOWN) may move a DISABLED resource.
pub fn reconcile_datum(
    txn: &mut TimelineTxn<'_>,
    start: Ms,
    reported: AvailabilityType,
    enablement: bool,
) -> DatumOutcome {
    let repaired = repair_open_intervals(txn);

    let current = match txn.timeline().find_current().cloned() {
        Some(current) => current,
        None => match heal_missing_current(txn, start, reported) {
            Healed::Appended(a) => {
                return DatumOutcome {
                    kind: DatumKind::Advanced,
                    changed: Some(a),
                    needs_full_report: repaired,
                };
            }
            Healed::Reopened(current) => current,
        },
    };

    if current.avail_type == AvailabilityType::Disabled
        && !(enablement && reported == AvailabilityType::Unknown)
    {
        debug!(
            resource_id = txn.resource_id(),
            reported = %reported,
            "resource disabled, ignoring datum"
        );
        return DatumOutcome::suppressed();
    }

    let mut outcome = if start >= current.start {
        advance(txn, &current, start, reported)
    } else {
        backfill(txn, start, reported)
    };
    outcome.needs_full_report |= repaired;
    outcome
}

/// Force the current type to `target` at `at`, bypassing the disabled guard.
/// Used by the bulk projection paths. `at` is clamped to the open interval's
/// start so history is never rewritten. Returns the new current interval if
/// the type changed.
pub fn force_current(
    txn: &mut TimelineTxn<'_>,
    target: AvailabilityType,
    at: Ms,
) -> Option<Availability> {
    repair_open_intervals(txn);
    let current = match txn.timeline().find_current().cloned() {
        Some(current) => current,
        None => match heal_missing_current(txn, at, target) {
            Healed::Appended(a) => return Some(a),
            Healed::Reopened(current) => current,
        },
    };
    if current.avail_type == target {
        return None;
    }
    let at = at.max(current.start);
    advance(txn, &current, at, target).changed
}

/// Forward path: `start >= current.start`.
fn advance(
    txn: &mut TimelineTxn<'_>,
    current: &Availability,
    start: Ms,
    reported: AvailabilityType,
) -> DatumOutcome {
    // The previous state was a guess; the agent should confirm it.
    let needs_full_report = current.avail_type == AvailabilityType::Unknown;
    if current.avail_type == reported {
        return DatumOutcome::unchanged(needs_full_report);
    }

    let changed = if start == current.start {
        txn.set_type(current.id, reported);
        coalesce(
            txn,
            Availability {
                avail_type: reported,
                ..current.clone()
            },
        )
    } else {
        txn.set_end(current.id, Some(start));
        let next = Availability::open(current.resource_id, start, reported);
        txn.append(next.clone());
        next
    };

    DatumOutcome {
        kind: DatumKind::Advanced,
        changed: Some(changed),
        needs_full_report,
    }
}

/// Backward path: `start < current.start`. Always asks for a full report.
fn backfill(txn: &mut TimelineTxn<'_>, start: Ms, reported: AvailabilityType) -> DatumOutcome {
    let resource_id = txn.resource_id();
    let Some(existing) = txn.timeline().find_containing(start).cloned() else {
        return backfill_gap(txn, start, reported);
    };

    if existing.avail_type == reported {
        return DatumOutcome::unchanged(true);
    }
    let Some(existing_end) = existing.end else {
        // Only reachable with overlapping open intervals, which were repaired above.
        return advance(txn, &existing, start, reported);
    };

    let after = txn.timeline().find_next_after(existing_end).cloned();
    let changed = match after {
        Some(after) if after.avail_type == reported => {
            // Extend the following interval back over the tail of `existing`.
            if existing.start == start {
                txn.remove(existing.id);
            } else {
                txn.set_end(existing.id, Some(start));
            }
            txn.set_start(after.id, start);
            coalesce(txn, Availability { start, ..after })
        }
        _ if existing.start == start => {
            txn.set_type(existing.id, reported);
            coalesce(
                txn,
                Availability {
                    avail_type: reported,
                    ..existing
                },
            )
        }
        after => {
            let until = after.map_or(existing_end, |a| a.start);
            txn.set_end(existing.id, Some(start));
            let inserted = Availability::closed(resource_id, start, until, reported);
            txn.append(inserted.clone());
            inserted
        }
    };

    DatumOutcome {
        kind: DatumKind::Backfilled,
        changed: Some(changed),
        needs_full_report: true,
    }
}

/// No interval contains `start`: it falls before recorded history or into a
/// hole left by purging.
fn backfill_gap(txn: &mut TimelineTxn<'_>, start: Ms, reported: AvailabilityType) -> DatumOutcome {
    let resource_id = txn.resource_id();
    debug!(resource_id, start, "datum precedes recorded history");

    let changed = match txn.timeline().find_next_after(start).cloned() {
        Some(next) if next.avail_type == reported => {
            txn.set_start(next.id, start);
            coalesce(txn, Availability { start, ..next })
        }
        Some(next) => {
            let inserted = Availability::closed(resource_id, start, next.start, reported);
            txn.append(inserted.clone());
            coalesce(txn, inserted)
        }
        None => {
            let appended = Availability::open(resource_id, start, reported);
            txn.append(appended.clone());
            appended
        }
    };

    DatumOutcome {
        kind: DatumKind::Backfilled,
        changed: Some(changed),
        needs_full_report: true,
    }
}

/// Merge `interval` with contiguous neighbours of the same type. Returns the
/// surviving interval.
fn coalesce(txn: &mut TimelineTxn<'_>, interval: Availability) -> Availability {
    let mut survivor = interval;
    let Some(pos) = txn.timeline().position(survivor.id) else {
        return survivor;
    };

    if let Some(next) = txn.timeline().intervals.get(pos + 1).cloned()
        && survivor.end == Some(next.start)
        && next.avail_type == survivor.avail_type
    {
        txn.set_end(survivor.id, next.end);
        txn.remove(next.id);
        survivor.end = next.end;
    }

    if pos > 0 {
        let prev = txn.timeline().intervals[pos - 1].clone();
        if prev.end == Some(survivor.start) && prev.avail_type == survivor.avail_type {
            txn.set_end(prev.id, survivor.end);
            txn.remove(survivor.id);
            survivor = Availability {
                end: survivor.end,
                ..prev
            };
        }
    }
    survivor
}

/// Keep only the latest-starting open interval; close the others at their
/// successor's start (or drop them if that would leave zero width).
/// Returns true if anything had to be repaired.
fn repair_open_intervals(txn: &mut TimelineTxn<'_>) -> bool {
    let open: Vec<(ulid::Ulid, Ms)> = txn
        .timeline()
        .intervals
        .iter()
        .filter(|a| a.is_open())
        .map(|a| (a.id, a.start))
        .collect();
    if open.len() <= 1 {
        return false;
    }

    warn!(
        resource_id = txn.resource_id(),
        open = open.len(),
        "multiple open intervals, keeping the latest"
    );
    metrics::counter!(observability::ANOMALIES_TOTAL, "kind" => "multiple_open").increment(1);

    for &(id, start) in &open[..open.len() - 1] {
        let successor_start = txn.timeline().position(id).and_then(|pos| {
            txn.timeline()
                .intervals
                .get(pos + 1)
                .map(|next| next.start)
        });
        match successor_start {
            Some(succ) if succ > start => txn.set_end(id, Some(succ)),
            _ => txn.remove(id),
        }
    }
    true
}

enum Healed {
    /// The timeline was empty; the datum became the open interval.
    Appended(Availability),
    /// The latest interval was reopened and is now current.
    Reopened(Availability),
}

fn heal_missing_current(
    txn: &mut TimelineTxn<'_>,
    start: Ms,
    reported: AvailabilityType,
) -> Healed {
    warn!(
        resource_id = txn.resource_id(),
        "no open interval, healing timeline"
    );
    metrics::counter!(observability::ANOMALIES_TOTAL, "kind" => "missing_current").increment(1);

    match txn.timeline().intervals.last().cloned() {
        Some(last) => {
            txn.set_end(last.id, None);
            Healed::Reopened(Availability { end: None, ..last })
        }
        None => {
            let appended = Availability::open(txn.resource_id(), start, reported);
            txn.append(appended.clone());
            Healed::Appended(appended)
        }
    }
}
