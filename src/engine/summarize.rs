use crate::model::*;

/// A stretch of a query range with a single status. `avail_type == None`
/// means no data: before recorded history, purged, or not happened yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start: Ms,
    pub end: Ms,
    pub avail_type: Option<AvailabilityType>,
}

impl Segment {
    fn no_data(start: Ms, end: Ms) -> Self {
        Self {
            start,
            end,
            avail_type: None,
        }
    }
}

// ── Flattening ────────────────────────────────────────────────────

/// Clip `intervals` (sorted by start) to `[range_start, range_end)`, fill any
/// holes with no-data segments and blank out everything from `now` on.
/// The result covers the whole range without gaps.
pub fn segments_for<'a>(
    intervals: impl IntoIterator<Item = &'a Availability>,
    range_start: Ms,
    range_end: Ms,
    now: Ms,
) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut cursor = range_start;
    for a in intervals {
        let start = a.start.max(cursor);
        let end = a.end.unwrap_or(range_end).min(range_end);
        if start >= end {
            continue;
        }
        if start > cursor {
            segments.push(Segment::no_data(cursor, start));
        }
        segments.push(Segment {
            start,
            end,
            avail_type: Some(a.avail_type),
        });
        cursor = end;
    }
    if cursor < range_end {
        segments.push(Segment::no_data(cursor, range_end));
    }
    merge_adjacent(blank_future(segments, now))
}

fn blank_future(segments: Vec<Segment>, now: Ms) -> Vec<Segment> {
    let mut out = Vec::with_capacity(segments.len() + 1);
    for seg in segments {
        if seg.end <= now {
            out.push(seg);
        } else if seg.start >= now {
            out.push(Segment::no_data(seg.start, seg.end));
        } else {
            out.push(Segment { end: now, ..seg });
            out.push(Segment::no_data(now, seg.end));
        }
    }
    out
}

/// Merge contiguous segments of equal status.
pub fn merge_adjacent(segments: Vec<Segment>) -> Vec<Segment> {
    let mut merged: Vec<Segment> = Vec::with_capacity(segments.len());
    for seg in segments {
        if let Some(last) = merged.last_mut()
            && last.end == seg.start
            && last.avail_type == seg.avail_type
        {
            last.end = seg.end;
            continue;
        }
        merged.push(seg);
    }
    merged
}

// ── Groups ────────────────────────────────────────────────────────

/// Status of a group at one instant, from its members' statuses.
/// DOWN beats DISABLED beats UNKNOWN (or no data) beats UP.
/// `None` only if no member has any data.
pub fn worst_of(types: impl IntoIterator<Item = Option<AvailabilityType>>) -> Option<AvailabilityType> {
    let (mut down, mut disabled, mut unknown, mut any_data) = (false, false, false, false);
    for t in types {
        match t {
            Some(AvailabilityType::Down) => down = true,
            Some(AvailabilityType::Disabled) => disabled = true,
            Some(AvailabilityType::Unknown) | None => unknown = true,
            Some(AvailabilityType::Up) => {}
        }
        any_data |= t.is_some();
    }
    if !any_data {
        return None;
    }
    Some(if down {
        AvailabilityType::Down
    } else if disabled {
        AvailabilityType::Disabled
    } else if unknown {
        AvailabilityType::Unknown
    } else {
        AvailabilityType::Up
    })
}

/// Sweep the members' segment lists into one group sequence over the range.
/// Each member list must cover the range, as `segments_for` guarantees.
pub fn aggregate_members(members: &[Vec<Segment>], range_start: Ms, range_end: Ms) -> Vec<Segment> {
    if range_start >= range_end {
        return Vec::new();
    }
    let mut bounds: Vec<Ms> = members
        .iter()
        .flatten()
        .flat_map(|s| [s.start, s.end])
        .chain([range_start, range_end])
        .filter(|b| (range_start..=range_end).contains(b))
        .collect();
    bounds.sort_unstable();
    bounds.dedup();

    let mut cursors = vec![0usize; members.len()];
    let mut out = Vec::with_capacity(bounds.len());
    for w in bounds.windows(2) {
        let (from, to) = (w[0], w[1]);
        let at_from = members.iter().zip(cursors.iter_mut()).map(|(segs, cur)| {
            while *cur < segs.len() && segs[*cur].end <= from {
                *cur += 1;
            }
            segs.get(*cur)
                .filter(|s| s.start <= from)
                .and_then(|s| s.avail_type)
        });
        out.push(Segment {
            start: from,
            end: to,
            avail_type: worst_of(at_from),
        });
    }
    merge_adjacent(out)
}

/// Live status of a group from its members' latest types: no members gives
/// `None`, all UP gives UP, anything else DOWN.
pub fn group_live_type(latest: &[AvailabilityType]) -> Option<AvailabilityType> {
    if latest.is_empty() {
        None
    } else if latest.iter().all(|t| *t == AvailabilityType::Up) {
        Some(AvailabilityType::Up)
    } else {
        Some(AvailabilityType::Down)
    }
}

// ── Buckets ───────────────────────────────────────────────────────

/// Pessimistic precedence: DOWN > DISABLED > UP (only when UP for the whole
/// bucket) > UNKNOWN.
pub fn resolve_bucket_type(
    time_up: Ms,
    bucket_width: Ms,
    has_down: bool,
    has_disabled: bool,
) -> AvailabilityType {
    if has_down {
        AvailabilityType::Down
    } else if has_disabled {
        AvailabilityType::Disabled
    } else if bucket_width > 0 && time_up == bucket_width {
        AvailabilityType::Up
    } else {
        AvailabilityType::Unknown
    }
}

#[derive(Debug, Default)]
struct BucketAccumulator {
    time_up: Ms,
    has_down: bool,
    has_disabled: bool,
}

impl BucketAccumulator {
    fn add(&mut self, avail_type: Option<AvailabilityType>, overlap: Ms) {
        if overlap <= 0 {
            return;
        }
        match avail_type {
            Some(AvailabilityType::Up) => self.time_up += overlap,
            Some(AvailabilityType::Down) => self.has_down = true,
            Some(AvailabilityType::Disabled) => self.has_disabled = true,
            Some(AvailabilityType::Unknown) | None => {}
        }
    }

    fn resolve(&self, width: Ms) -> AvailabilityType {
        resolve_bucket_type(self.time_up, width, self.has_down, self.has_disabled)
    }
}

/// One point per bucket, oldest first, each stamped with its bucket's start.
///
/// Buckets are cut from `range_end` backwards with the integer-division width,
/// so the oldest bucket starts exactly at `range_start` and absorbs the
/// remainder. Returns nothing unless `buckets > 0` and `range_start < range_end`.
pub fn summarize(
    segments: &[Segment],
    range_start: Ms,
    range_end: Ms,
    buckets: usize,
) -> Vec<AvailabilityPoint> {
    if buckets == 0 || range_start >= range_end {
        return Vec::new();
    }
    let Some(span) = range_end.checked_sub(range_start) else {
        return Vec::new();
    };
    let width = span / buckets as Ms;

    let mut points = Vec::with_capacity(buckets);
    let mut idx = segments.len();
    let mut bucket_end = range_end;
    for i in 0..buckets {
        let bucket_start = if i + 1 == buckets {
            range_start
        } else {
            bucket_end - width
        };

        let mut acc = BucketAccumulator::default();
        while idx > 0 {
            let seg = &segments[idx - 1];
            if seg.start >= bucket_end {
                idx -= 1;
                continue;
            }
            if seg.end <= bucket_start {
                break;
            }
            acc.add(
                seg.avail_type,
                seg.end.min(bucket_end) - seg.start.max(bucket_start),
            );
            if seg.start >= bucket_start {
                idx -= 1;
            } else {
                // Continues into the next older bucket.
                break;
            }
        }

        points.push(AvailabilityPoint {
            avail_type: Some(acc.resolve(bucket_end - bucket_start)),
            timestamp: bucket_start,
        });
        bucket_end = bucket_start;
    }

    points.reverse();
    points
}
