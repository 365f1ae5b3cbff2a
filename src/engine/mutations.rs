use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::agent::spawn_full_report_request;
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::arbiter::{self, Admission};
use super::reconcile::{force_current, reconcile_datum, DatumKind};
use super::{now_ms, Engine, EngineError, Timeline, WalCommand};

/// A datum that passed validation.
#[derive(Debug, Clone, Copy)]
struct ValidDatum {
    resource_id: ResourceId,
    start: Ms,
    avail_type: AvailabilityType,
}

fn validate_datum(datum: &ReportDatum) -> Result<ValidDatum, EngineError> {
    let resource_id = datum
        .resource_id
        .ok_or(EngineError::InvalidDatum("missing resource id"))?;
    if !valid_timestamp(datum.start) {
        return Err(EngineError::InvalidDatum("timestamp out of range"));
    }
    Ok(ValidDatum {
        resource_id,
        start: datum.start,
        avail_type: datum.avail_type,
    })
}

fn validate_name(name: &Option<String>) -> Result<(), EngineError> {
    if name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

impl Engine {
    // ── Resources ────────────────────────────────────────────

    pub async fn create_resource(&self, info: ResourceInfo) -> Result<(), EngineError> {
        self.create_resource_at(info, now_ms()).await
    }

    /// Create a resource whose history starts as UNKNOWN at `created_at`.
    pub async fn create_resource_at(
        &self,
        info: ResourceInfo,
        created_at: Ms,
    ) -> Result<(), EngineError> {
        if self.state.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        validate_name(&info.name)?;
        if !valid_timestamp(created_at) {
            return Err(EngineError::InvalidDatum("timestamp out of range"));
        }
        if self.state.contains_key(&info.id) {
            return Err(EngineError::AlreadyExists(info.id));
        }
        if let Some(pid) = info.parent_id {
            if pid == info.id {
                return Err(EngineError::CycleDetected(info.id));
            }
            if !self.state.contains_key(&pid) {
                return Err(EngineError::NotFound(pid));
            }
        }

        let _gate = self.compaction_gate.read().await;
        let seed = Availability::open(info.id, created_at, AvailabilityType::Unknown);
        let event = Event::ResourceCreated {
            info: info.clone(),
            seed: seed.clone(),
        };
        self.wal_append(&event).await?;
        self.insert_timeline(Timeline::with_intervals(info, vec![seed]));
        metrics::gauge!(observability::RESOURCES_ACTIVE).set(self.state.len() as f64);
        Ok(())
    }

    pub async fn delete_resource(&self, id: ResourceId) -> Result<(), EngineError> {
        let shared = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        if let Some(kids) = self.children.get(&id)
            && !kids.is_empty()
        {
            return Err(EngineError::HasChildren(id));
        }

        let _gate = self.compaction_gate.read().await;
        let guard = shared.write().await;
        self.wal_append(&Event::ResourceDeleted { id }).await?;
        self.unindex(&guard.info);
        self.state.remove(&id);
        drop(guard);

        self.latest.remove(id);
        self.notify.remove(id);
        metrics::gauge!(observability::RESOURCES_ACTIVE).set(self.state.len() as f64);
        Ok(())
    }

    // ── Groups ───────────────────────────────────────────────

    fn check_members(&self, members: &[ResourceId]) -> Result<Vec<ResourceId>, EngineError> {
        if members.len() > MAX_GROUP_MEMBERS {
            return Err(EngineError::LimitExceeded("too many group members"));
        }
        let mut members = members.to_vec();
        members.sort_unstable();
        members.dedup();
        if let Some(missing) = members.iter().find(|m| !self.state.contains_key(*m)) {
            return Err(EngineError::NotFound(*missing));
        }
        Ok(members)
    }

    pub async fn create_group(
        &self,
        id: GroupId,
        name: Option<String>,
        members: &[ResourceId],
    ) -> Result<(), EngineError> {
        if self.groups.len() >= MAX_GROUPS {
            return Err(EngineError::LimitExceeded("too many groups"));
        }
        validate_name(&name)?;
        if self.groups.contains_key(&id) {
            return Err(EngineError::GroupAlreadyExists(id));
        }
        let group = GroupInfo {
            id,
            name,
            members: self.check_members(members)?,
        };
        let _gate = self.compaction_gate.read().await;
        self.wal_append(&Event::GroupCreated {
            group: group.clone(),
        })
        .await?;
        self.groups.insert(id, group);
        Ok(())
    }

    pub async fn set_group_members(
        &self,
        id: GroupId,
        members: &[ResourceId],
    ) -> Result<(), EngineError> {
        if !self.groups.contains_key(&id) {
            return Err(EngineError::GroupNotFound(id));
        }
        let members = self.check_members(members)?;
        let _gate = self.compaction_gate.read().await;
        self.wal_append(&Event::GroupMembersSet {
            id,
            members: members.clone(),
        })
        .await?;
        if let Some(mut group) = self.groups.get_mut(&id) {
            group.members = members;
        }
        Ok(())
    }

    pub async fn delete_group(&self, id: GroupId) -> Result<(), EngineError> {
        if !self.groups.contains_key(&id) {
            return Err(EngineError::GroupNotFound(id));
        }
        let _gate = self.compaction_gate.read().await;
        self.wal_append(&Event::GroupDeleted { id }).await?;
        self.groups.remove(&id);
        Ok(())
    }

    // ── Report ingestion ─────────────────────────────────────

    /// Fold an agent report into the affected timelines.
    ///
    /// Datums are sorted by (resource, start, type), not taken in report order,
    /// and reconciled in chunks of `chunk_size`; each chunk is one WAL record. Invalid datums are dropped
    /// individually. A WAL failure fails the report; chunks committed before
    /// it stay committed, and retrying the report is safe.
    pub async fn merge_availability_report(
        &self,
        report: AvailabilityReport,
    ) -> Result<MergeOutcome, EngineError> {
        let started = Instant::now();
        let kind = observability::report_kind_label(&report);

        if report.data.is_empty() {
            error!(agent_id = ?report.agent_id, kind, "agent sent an empty availability report");
            metrics::counter!(observability::REPORTS_TOTAL, "kind" => kind, "outcome" => "empty")
                .increment(1);
            return Ok(MergeOutcome {
                accepted: true,
                resync_requested: false,
            });
        }
        if report.data.len() > MAX_REPORT_DATA {
            return Err(EngineError::LimitExceeded("too many datums in report"));
        }

        let backfilled = report
            .agent_id
            .is_some_and(|agent| self.agents.is_agent_backfilled(agent));
        if let Some(agent) = report.agent_id
            && !report.enablement
        {
            self.agents.record_report(agent, now_ms());
        }

        if arbiter::admit(&report, backfilled) == Admission::SkipAndResync {
            debug!(
                agent_id = ?report.agent_id,
                datums = report.data.len(),
                "agent was backfilled, skipping delta report and asking for a full one"
            );
            if let Some(agent) = report.agent_id {
                spawn_full_report_request(self.agent_client.clone(), agent, self.agent_timeout);
            }
            metrics::counter!(observability::REPORTS_TOTAL, "kind" => kind, "outcome" => "skipped")
                .increment(1);
            return Ok(MergeOutcome {
                accepted: false,
                resync_requested: true,
            });
        }

        let mut data = Vec::with_capacity(report.data.len());
        for datum in &report.data {
            match validate_datum(datum) {
                Ok(valid) => data.push(valid),
                Err(e) => {
                    warn!(agent_id = ?report.agent_id, ?datum, error = %e, "rejecting datum");
                    metrics::counter!(observability::DATUMS_TOTAL, "outcome" => "rejected")
                        .increment(1);
                }
            }
        }
        data.sort_by_key(|d| (d.resource_id, d.start, d.avail_type));

        let mut needs_full_report = false;
        let mut changed = Vec::new();
        for chunk in data.chunks(self.chunk_size) {
            let result = self.reconcile_chunk(chunk, report.enablement).await;
            let (chunk_changed, chunk_needs) = match result {
                Ok(r) => r,
                Err(e) => {
                    metrics::counter!(observability::REPORTS_TOTAL, "kind" => kind, "outcome" => "failed")
                        .increment(1);
                    return Err(e);
                }
            };
            needs_full_report |= chunk_needs;
            changed.extend(chunk_changed);
        }

        let resync = arbiter::resync_requested(&report, needs_full_report);
        if resync && let Some(agent) = report.agent_id {
            debug!(agent_id = agent, "server unsure of agent state, asking for a full report");
            spawn_full_report_request(self.agent_client.clone(), agent, self.agent_timeout);
        }
        self.notify.publish(changed);

        metrics::counter!(observability::REPORTS_TOTAL, "kind" => kind, "outcome" => "merged")
            .increment(1);
        metrics::histogram!(observability::REPORT_DURATION_SECONDS, "kind" => kind)
            .record(started.elapsed().as_secs_f64());
        Ok(MergeOutcome {
            accepted: true,
            resync_requested: resync,
        })
    }

    /// Reconcile one sorted chunk under its resources' write locks.
    /// Returns the changed intervals and whether any datum wants a full report.
    async fn reconcile_chunk(
        &self,
        chunk: &[ValidDatum],
        enablement: bool,
    ) -> Result<(Vec<Availability>, bool), EngineError> {
        let ids: Vec<ResourceId> = chunk.iter().map(|d| d.resource_id).collect();
        let mut changed = Vec::new();
        let mut needs_full_report = false;
        let mut kinds: Vec<DatumKind> = Vec::with_capacity(chunk.len());

        let missing = self
            .commit_locked(&ids, |txn| {
                let rid = txn.resource_id();
                let from = chunk.partition_point(|d| d.resource_id < rid);
                for d in chunk[from..].iter().take_while(|d| d.resource_id == rid) {
                    let outcome = reconcile_datum(txn, d.start, d.avail_type, enablement);
                    needs_full_report |= outcome.needs_full_report;
                    kinds.push(outcome.kind);
                    changed.extend(outcome.changed);
                }
            })
            .await?;

        for kind in kinds {
            metrics::counter!(observability::DATUMS_TOTAL, "outcome" => kind.label()).increment(1);
        }
        for id in missing {
            let count = chunk.iter().filter(|d| d.resource_id == id).count();
            warn!(resource_id = id, datums = count, "rejecting datums for unknown resource");
            metrics::counter!(observability::DATUMS_TOTAL, "outcome" => "rejected")
                .increment(count as u64);
        }
        Ok((changed, needs_full_report))
    }

    // ── Bulk projection ──────────────────────────────────────

    /// Force every listed resource to `avail_type` at `at`, skipping history
    /// reconciliation and the disabled guard. Resources already of that type
    /// are untouched. Returns the new current intervals.
    pub async fn set_latest_for_resources(
        &self,
        resource_ids: &[ResourceId],
        avail_type: AvailabilityType,
        at: Ms,
    ) -> Result<Vec<Availability>, EngineError> {
        self.bulk_force(resource_ids, at, |_| Some(avail_type)).await
    }

    /// Move all resources of an agent: platforms to `platform_type`, the rest
    /// to `child_type`. DISABLED resources are left alone.
    pub async fn update_agent_resource_availabilities(
        &self,
        agent_id: AgentId,
        platform_type: AvailabilityType,
        child_type: AvailabilityType,
    ) -> Result<Vec<Availability>, EngineError> {
        let ids = self
            .agent_resources
            .get(&agent_id)
            .map(|r| r.value().clone())
            .unwrap_or_default();
        self.bulk_force(&ids, now_ms(), |tl| {
            if tl.current_type() == AvailabilityType::Disabled {
                None
            } else if tl.info.is_platform() {
                Some(platform_type)
            } else {
                Some(child_type)
            }
        })
        .await
    }

    async fn bulk_force(
        &self,
        resource_ids: &[ResourceId],
        at: Ms,
        target: impl Fn(&Timeline) -> Option<AvailabilityType>,
    ) -> Result<Vec<Availability>, EngineError> {
        if !valid_timestamp(at) {
            return Err(EngineError::InvalidDatum("timestamp out of range"));
        }
        let mut ids = resource_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut changed = Vec::new();
        for chunk in ids.chunks(self.chunk_size) {
            let missing = self
                .commit_locked(chunk, |txn| {
                    if let Some(t) = target(txn.timeline())
                        && let Some(a) = force_current(txn, t, at)
                    {
                        changed.push(a);
                    }
                })
                .await?;
            for id in missing {
                debug!(resource_id = id, "bulk update skipped unknown resource");
            }
        }
        self.notify.publish(changed.clone());
        Ok(changed)
    }

    /// Mark the agent as backfilled and move its non-disabled resources to UNKNOWN.
    pub async fn backfill_agent(&self, agent_id: AgentId) -> Result<usize, EngineError> {
        self.agents.set_backfilled(agent_id, true);
        let changed = self
            .update_agent_resource_availabilities(
                agent_id,
                AvailabilityType::Unknown,
                AvailabilityType::Unknown,
            )
            .await?;
        info!(agent_id, resources = changed.len(), "agent backfilled to unknown");
        metrics::counter!(observability::AGENTS_BACKFILLED_TOTAL).increment(1);
        Ok(changed.len())
    }

    pub async fn disable_resources(
        &self,
        resource_ids: &[ResourceId],
    ) -> Result<Vec<Availability>, EngineError> {
        self.set_latest_for_resources(resource_ids, AvailabilityType::Disabled, now_ms())
            .await
    }

    /// Re-enable through an enablement report: UNKNOWN is the only datum that
    /// gets past the disabled guard.
    pub async fn enable_resources(
        &self,
        resource_ids: &[ResourceId],
    ) -> Result<MergeOutcome, EngineError> {
        let now = now_ms();
        let data = resource_ids
            .iter()
            .map(|id| ReportDatum::new(*id, now, AvailabilityType::Unknown))
            .collect();
        self.merge_availability_report(AvailabilityReport::enablement(data))
            .await
    }

    // ── Retention ────────────────────────────────────────────

    /// Remove closed intervals that ended at or before `oldest`. Open
    /// intervals are never purged. Returns how many were removed.
    pub async fn purge_availabilities(&self, oldest: Ms) -> Result<usize, EngineError> {
        let mut ids: Vec<ResourceId> = self.state.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();

        let mut purged = 0usize;
        for chunk in ids.chunks(self.chunk_size) {
            self.commit_locked(chunk, |txn| {
                let doomed: Vec<ulid::Ulid> =
                    txn.timeline().purgeable(oldest).map(|a| a.id).collect();
                purged += doomed.len();
                for id in doomed {
                    txn.remove(id);
                }
            })
            .await?;
        }

        if purged > 0 {
            info!(oldest, purged, "purged old availability intervals");
        }
        metrics::counter!(observability::PURGED_INTERVALS_TOTAL).increment(purged as u64);
        Ok(purged)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as one snapshot record per resource (parents first)
    /// followed by the groups.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;
        let ids: Vec<ResourceId> = self.state.iter().map(|e| *e.key()).collect();
        let mut snapshots: HashMap<ResourceId, (ResourceInfo, Vec<Availability>)> =
            HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(shared) = self.get_resource(&id) {
                let tl = shared.read().await;
                snapshots.insert(id, (tl.info.clone(), tl.intervals.clone()));
            }
        }

        fn emit_resource(
            id: ResourceId,
            snapshots: &mut HashMap<ResourceId, (ResourceInfo, Vec<Availability>)>,
            events: &mut Vec<Event>,
            visited: &mut HashSet<ResourceId>,
        ) {
            if !visited.insert(id) {
                return;
            }
            let Some((info, intervals)) = snapshots.remove(&id) else {
                return;
            };
            if let Some(pid) = info.parent_id {
                emit_resource(pid, snapshots, events, visited);
            }
            events.push(Event::ResourceRestored { info, intervals });
        }

        let mut order: Vec<ResourceId> = snapshots.keys().copied().collect();
        order.sort_unstable();
        let mut events = Vec::with_capacity(order.len() + self.groups.len());
        let mut visited = HashSet::new();
        for id in order {
            emit_resource(id, &mut snapshots, &mut events, &mut visited);
        }
        for group in self.groups.iter() {
            events.push(Event::GroupCreated {
                group: group.value().clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
