use ulid::Ulid;

use crate::model::*;

/// One resource's availability history plus its metadata.
///
/// Intervals are kept sorted by `start`. Under normal operation they are
/// contiguous, non-overlapping, and only the last one is open; the reconciler
/// repairs timelines that drifted from that shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeline {
    pub info: ResourceInfo,
    pub intervals: Vec<Availability>,
}

impl Timeline {
    pub fn new(info: ResourceInfo) -> Self {
        Self {
            info,
            intervals: Vec::new(),
        }
    }

    pub fn with_intervals(info: ResourceInfo, mut intervals: Vec<Availability>) -> Self {
        intervals.sort_by_key(|a| a.start);
        Self { info, intervals }
    }

    pub fn resource_id(&self) -> ResourceId {
        self.info.id
    }

    // ── Lookups ──────────────────────────────────────────────

    /// The open interval. With several (an anomaly) the latest-starting one wins.
    pub fn find_current(&self) -> Option<&Availability> {
        self.intervals.iter().rev().find(|a| a.is_open())
    }

    /// Type of the open interval, UNKNOWN when there is none.
    pub fn current_type(&self) -> AvailabilityType {
        self.find_current()
            .map_or(AvailabilityType::Unknown, |a| a.avail_type)
    }

    pub fn open_count(&self) -> usize {
        self.intervals.iter().filter(|a| a.is_open()).count()
    }

    pub fn position(&self, id: Ulid) -> Option<usize> {
        self.intervals.iter().position(|a| a.id == id)
    }

    /// The interval whose `[start, end)` contains `t`.
    pub fn find_containing(&self, t: Ms) -> Option<&Availability> {
        let idx = self.intervals.partition_point(|a| a.start <= t);
        self.intervals[..idx]
            .last()
            .filter(|a| a.contains_instant(t))
    }

    /// First interval starting at or after `t`.
    pub fn find_next_after(&self, t: Ms) -> Option<&Availability> {
        let idx = self.intervals.partition_point(|a| a.start < t);
        self.intervals.get(idx)
    }

    /// Intervals overlapping `[start, end)`, ascending.
    /// Uses binary search to skip intervals starting at or after `end`.
    pub fn overlapping(&self, start: Ms, end: Ms) -> impl Iterator<Item = &Availability> {
        let right_bound = self.intervals.partition_point(|a| a.start < end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |a| a.end.is_none_or(|e| e > start))
    }

    /// The `n` most recent intervals, newest first.
    pub fn latest(&self, n: usize) -> impl Iterator<Item = &Availability> {
        self.intervals.iter().rev().take(n)
    }

    /// Closed intervals that ended at or before `oldest`.
    pub fn purgeable(&self, oldest: Ms) -> impl Iterator<Item = &Availability> {
        self.intervals
            .iter()
            .filter(move |a| a.end.is_some_and(|e| e <= oldest))
    }

    // ── Mutations ────────────────────────────────────────────

    /// Insert keeping sort order; equal starts go after existing ones.
    pub fn insert(&mut self, interval: Availability) {
        let pos = self.intervals.partition_point(|a| a.start <= interval.start);
        self.intervals.insert(pos, interval);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Availability> {
        let pos = self.position(id)?;
        Some(self.intervals.remove(pos))
    }

    pub fn apply(&mut self, op: &TimelineOp) {
        match op {
            TimelineOp::Append(a) => self.insert(a.clone()),
            TimelineOp::SetEnd { id, end } => {
                if let Some(pos) = self.position(*id) {
                    self.intervals[pos].end = *end;
                }
            }
            TimelineOp::SetStart { id, start } => {
                if let Some(mut a) = self.remove(*id) {
                    a.start = *start;
                    self.insert(a);
                }
            }
            TimelineOp::SetType { id, avail_type } => {
                if let Some(pos) = self.position(*id) {
                    self.intervals[pos].avail_type = *avail_type;
                }
            }
            TimelineOp::Remove { id } => {
                self.remove(*id);
            }
        }
    }

    /// Sorted, positive widths, contiguous, exactly one open interval and it is last.
    pub fn check_invariants(&self) -> Result<(), String> {
        let Some(last) = self.intervals.last() else {
            return Err("timeline is empty".into());
        };
        if !last.is_open() {
            return Err(format!("last interval {} is closed", last.id));
        }
        for pair in self.intervals.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            match a.end {
                None => return Err(format!("interval {} is open but not last", a.id)),
                Some(end) if end <= a.start => {
                    return Err(format!("interval {} has non-positive width", a.id));
                }
                Some(end) if end != b.start => {
                    return Err(format!("gap or overlap between {} and {}", a.id, b.id));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Records every mutation applied to a timeline so the whole set can be
/// written to the WAL as one record.
pub struct TimelineTxn<'a> {
    timeline: &'a mut Timeline,
    ops: Vec<TimelineOp>,
}

impl<'a> TimelineTxn<'a> {
    pub fn new(timeline: &'a mut Timeline) -> Self {
        Self {
            timeline,
            ops: Vec::new(),
        }
    }

    pub fn timeline(&self) -> &Timeline {
        self.timeline
    }

    pub fn resource_id(&self) -> ResourceId {
        self.timeline.resource_id()
    }

    pub fn append(&mut self, interval: Availability) {
        self.record(TimelineOp::Append(interval));
    }

    pub fn set_end(&mut self, id: Ulid, end: Option<Ms>) {
        self.record(TimelineOp::SetEnd { id, end });
    }

    pub fn set_start(&mut self, id: Ulid, start: Ms) {
        self.record(TimelineOp::SetStart { id, start });
    }

    pub fn set_type(&mut self, id: Ulid, avail_type: AvailabilityType) {
        self.record(TimelineOp::SetType { id, avail_type });
    }

    pub fn remove(&mut self, id: Ulid) {
        self.record(TimelineOp::Remove { id });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<TimelineOp> {
        self.ops
    }

    fn record(&mut self, op: TimelineOp) {
        self.timeline.apply(&op);
        self.ops.push(op);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AvailabilityType::*;

    fn timeline(spans: &[(Ms, Option<Ms>, AvailabilityType)]) -> Timeline {
        let intervals = spans
            .iter()
            .map(|&(start, end, t)| Availability {
                id: Ulid::new(),
                resource_id: 1,
                start,
                end,
                avail_type: t,
            })
            .collect();
        Timeline::with_intervals(ResourceInfo::new(1), intervals)
    }

    #[test]
    fn containing_and_next() {
        let tl = timeline(&[(0, Some(100), Up), (100, Some(200), Down), (200, None, Up)]);
        assert_eq!(tl.find_containing(50).unwrap().start, 0);
        assert_eq!(tl.find_containing(100).unwrap().start, 100);
        assert_eq!(tl.find_containing(10_000).unwrap().start, 200);
        assert!(tl.find_containing(-1).is_none());

        assert_eq!(tl.find_next_after(100).unwrap().start, 100);
        assert_eq!(tl.find_next_after(101).unwrap().start, 200);
        assert!(tl.find_next_after(201).is_none());
    }

    #[test]
    fn containing_skips_gap() {
        let tl = timeline(&[(0, Some(100), Up), (150, None, Down)]);
        assert!(tl.find_containing(120).is_none());
        assert_eq!(tl.find_next_after(120).unwrap().start, 150);
    }

    #[test]
    fn current_prefers_latest_open() {
        let tl = timeline(&[(0, None, Up), (100, None, Down)]);
        assert_eq!(tl.open_count(), 2);
        assert_eq!(tl.find_current().unwrap().start, 100);
        assert_eq!(tl.current_type(), Down);
        assert_eq!(timeline(&[(0, Some(5), Up)]).current_type(), Unknown);
    }

    #[test]
    fn overlapping_window() {
        let tl = timeline(&[(0, Some(100), Up), (100, Some(200), Down), (200, None, Up)]);
        let starts: Vec<Ms> = tl.overlapping(150, 250).map(|a| a.start).collect();
        assert_eq!(starts, vec![100, 200]);
        let starts: Vec<Ms> = tl.overlapping(0, 100).map(|a| a.start).collect();
        assert_eq!(starts, vec![0]);
    }

    #[test]
    fn latest_is_newest_first() {
        let tl = timeline(&[(0, Some(100), Up), (100, Some(200), Down), (200, None, Up)]);
        let starts: Vec<Ms> = tl.latest(2).map(|a| a.start).collect();
        assert_eq!(starts, vec![200, 100]);
    }

    #[test]
    fn purgeable_only_closed_before_cutoff() {
        let tl = timeline(&[(0, Some(100), Up), (100, Some(200), Down), (200, None, Up)]);
        let starts: Vec<Ms> = tl.purgeable(150).map(|a| a.start).collect();
        assert_eq!(starts, vec![0]);
        assert_eq!(tl.purgeable(10_000).count(), 2);
    }

    #[test]
    fn set_start_keeps_sorted() {
        let mut tl = timeline(&[(0, Some(100), Up), (100, None, Down)]);
        let id = tl.intervals[1].id;
        tl.apply(&TimelineOp::SetStart { id, start: 50 });
        tl.apply(&TimelineOp::SetEnd { id: tl.intervals[0].id, end: Some(50) });
        assert_eq!(tl.intervals[1].start, 50);
        assert!(tl.check_invariants().is_ok());
    }

    #[test]
    fn invariant_violations_are_reported() {
        assert!(timeline(&[]).check_invariants().is_err());
        assert!(timeline(&[(0, Some(100), Up)]).check_invariants().is_err());
        assert!(timeline(&[(0, None, Up), (100, None, Up)]).check_invariants().is_err());
        assert!(timeline(&[(0, Some(90), Up), (100, None, Up)]).check_invariants().is_err());
        assert!(timeline(&[(0, Some(100), Up), (100, None, Down)]).check_invariants().is_ok());
    }

    #[test]
    fn txn_records_and_replays() {
        let mut tl = timeline(&[(0, None, Unknown)]);
        let before = tl.clone();
        let open_id = tl.intervals[0].id;

        let ops = {
            let mut txn = TimelineTxn::new(&mut tl);
            txn.set_end(open_id, Some(100));
            txn.append(Availability::open(1, 100, Up));
            assert!(!txn.is_empty());
            txn.into_ops()
        };

        let mut replayed = before;
        for op in &ops {
            replayed.apply(op);
        }
        assert_eq!(replayed, tl);
        assert!(tl.check_invariants().is_ok());
    }
}
