use std::time::Instant;

use tracing::warn;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::summarize::{aggregate_members, group_live_type, segments_for, summarize, Segment};
use super::{now_ms, Engine, EngineError};

impl Engine {
    /// Latest-state projection; UNKNOWN for resources never seen.
    pub fn get_current_type(&self, resource_id: ResourceId) -> AvailabilityType {
        self.latest.get_latest(resource_id)
    }

    /// The open interval. Falls back to the most recent interval (with a
    /// warning) and then to a synthesized UNKNOWN.
    pub async fn get_current_availability(
        &self,
        resource_id: ResourceId,
    ) -> Result<Availability, EngineError> {
        let shared = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let tl = shared.read().await;
        if let Some(current) = tl.find_current() {
            return Ok(current.clone());
        }
        warn!(resource_id, "resource has no open availability interval");
        Ok(tl
            .intervals
            .last()
            .cloned()
            .unwrap_or_else(|| Availability::open(resource_id, now_ms(), AvailabilityType::Unknown)))
    }

    /// Intervals overlapping `[start, end)`, ascending. Empty for unknown resources.
    pub async fn find_availability_within(
        &self,
        resource_id: ResourceId,
        start: Ms,
        end: Ms,
    ) -> Vec<Availability> {
        let Some(shared) = self.get_resource(&resource_id) else {
            return Vec::new();
        };
        let tl = shared.read().await;
        tl.overlapping(start, end)
            .take(MAX_HISTORY_PAGE)
            .cloned()
            .collect()
    }

    /// The `n` most recent intervals, newest first.
    pub async fn find_latest_availabilities(
        &self,
        resource_id: ResourceId,
        n: usize,
    ) -> Vec<Availability> {
        let Some(shared) = self.get_resource(&resource_id) else {
            return Vec::new();
        };
        let tl = shared.read().await;
        tl.latest(n.min(MAX_HISTORY_PAGE)).cloned().collect()
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let shared: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(shared.len());
        for s in shared {
            out.push(s.read().await.info.clone());
        }
        out.sort_by_key(|info| info.id);
        out
    }

    pub fn get_group(&self, id: GroupId) -> Option<GroupInfo> {
        self.groups.get(&id).map(|g| g.value().clone())
    }

    pub fn get_children(&self, parent_id: ResourceId) -> Vec<ResourceId> {
        self.children
            .get(&parent_id)
            .map(|kids| kids.value().clone())
            .unwrap_or_default()
    }

    /// Resources a context summarizes over.
    pub async fn context_members(&self, context: &Context) -> Vec<ResourceId> {
        match context {
            Context::Resource(id) => vec![*id],
            Context::Group(id) => self.get_group(*id).map(|g| g.members).unwrap_or_default(),
            Context::AutoGroup {
                parent_id,
                resource_type,
            } => {
                let mut members = Vec::new();
                for child in self.get_children(*parent_id) {
                    if let Some(shared) = self.get_resource(&child)
                        && shared.read().await.info.resource_type.as_deref()
                            == Some(resource_type.as_str())
                    {
                        members.push(child);
                    }
                }
                members.sort_unstable();
                members
            }
        }
    }

    /// One status point per bucket over `[range_start, range_end)`, oldest first.
    ///
    /// Empty when `buckets == 0` or the range is empty; bounds outside the valid
    /// timestamp range are rejected. With `include_current`
    /// the last point carries the live status instead of the historical one.
    pub async fn get_bucketed_availability(
        &self,
        context: &Context,
        range_start: Ms,
        range_end: Ms,
        buckets: usize,
        include_current: bool,
    ) -> Result<Vec<AvailabilityPoint>, EngineError> {
        if !valid_timestamp(range_start) || !valid_timestamp(range_end) {
            return Err(EngineError::InvalidDatum("query range out of bounds"));
        }
        if buckets == 0 || range_start >= range_end {
            return Ok(Vec::new());
        }
        if buckets > MAX_BUCKETS {
            return Err(EngineError::LimitExceeded("too many buckets"));
        }
        let started = Instant::now();
        let now = now_ms();

        let segments = match context {
            Context::Resource(id) => self.resource_segments(*id, range_start, range_end, now).await,
            Context::Group(_) | Context::AutoGroup { .. } => {
                let members = self.context_members(context).await;
                let mut per_member = Vec::with_capacity(members.len());
                for id in members {
                    per_member.push(self.resource_segments(id, range_start, range_end, now).await);
                }
                aggregate_members(&per_member, range_start, range_end)
            }
        };

        let mut points = summarize(&segments, range_start, range_end, buckets);
        if include_current && let Some(last) = points.last_mut() {
            last.avail_type = self.live_type(context).await;
        }

        if points.len() != buckets {
            warn!(
                context = ?context,
                expected = buckets,
                got = points.len(),
                "bucket count mismatch"
            );
            metrics::counter!(observability::BUCKET_COUNT_MISMATCH_TOTAL).increment(1);
        }
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "context" => context.label())
            .record(started.elapsed().as_secs_f64());
        Ok(points)
    }

    /// Live status of a context: the latest-state projection for a resource,
    /// the group live rule otherwise.
    pub async fn live_type(&self, context: &Context) -> Option<AvailabilityType> {
        match context {
            Context::Resource(id) => Some(self.latest.get_latest(*id)),
            Context::Group(_) | Context::AutoGroup { .. } => {
                let latest: Vec<AvailabilityType> = self
                    .context_members(context)
                    .await
                    .into_iter()
                    .map(|id| self.latest.get_latest(id))
                    .collect();
                group_live_type(&latest)
            }
        }
    }

    /// Snapshot of one resource's history flattened over the range.
    async fn resource_segments(
        &self,
        resource_id: ResourceId,
        range_start: Ms,
        range_end: Ms,
        now: Ms,
    ) -> Vec<Segment> {
        match self.get_resource(&resource_id) {
            Some(shared) => {
                let tl = shared.read().await;
                segments_for(tl.overlapping(range_start, range_end), range_start, range_end, now)
            }
            None => segments_for(std::iter::empty::<&Availability>(), range_start, range_end, now),
        }
    }
}
