mod arbiter;
mod error;
mod latest;
mod mutations;
mod queries;
mod reconcile;
mod store;
mod summarize;

pub use arbiter::{admit, resync_requested, Admission};
pub use error::EngineError;
pub use latest::LatestStateCache;
pub use reconcile::{force_current, reconcile_datum, DatumKind, DatumOutcome};
pub use store::{Timeline, TimelineTxn};
pub use summarize::{
    aggregate_members, group_live_type, merge_adjacent, resolve_bucket_type, segments_for,
    summarize, worst_of, Segment,
};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::{info, warn};

use crate::agent::{AgentClient, AgentDirectory, AgentRegistry, NoopAgentClient};
use crate::limits::DEFAULT_CHUNK_SIZE;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedTimeline = Arc<RwLock<Timeline>>;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. One `sync` for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        warn!(error = %e, events = batch.len(), "WAL flush failed");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.push(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even after an append error, so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.rewrite(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.records_since_rewrite());
        }
        WalCommand::Append { event, response } => {
            commit_batch(wal, &mut vec![(event, response)]);
        }
    }
}

/// The engine's outside collaborators.
pub struct Collaborators {
    pub notify: Arc<NotifyHub>,
    pub agents: Arc<dyn AgentDirectory>,
    pub agent_client: Arc<dyn AgentClient>,
    /// Upper bound on one full-report request.
    pub agent_timeout: Duration,
}

impl Collaborators {
    /// In-memory agent registry, no agent transport.
    pub fn standalone() -> Self {
        Self {
            notify: Arc::new(NotifyHub::new()),
            agents: Arc::new(AgentRegistry::new()),
            agent_client: Arc::new(NoopAgentClient),
            agent_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Engine {
    pub state: DashMap<ResourceId, SharedTimeline>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub latest: LatestStateCache,
    pub notify: Arc<NotifyHub>,
    pub agents: Arc<dyn AgentDirectory>,
    pub(super) agent_client: Arc<dyn AgentClient>,
    pub(super) agent_timeout: Duration,
    pub(super) chunk_size: usize,
    /// Parent → children index.
    pub(super) children: DashMap<ResourceId, Vec<ResourceId>>,
    /// Agent → monitored resources index.
    pub(super) agent_resources: DashMap<AgentId, Vec<ResourceId>>,
    pub(super) groups: DashMap<GroupId, GroupInfo>,
    /// Held shared by every WAL-append-then-apply sequence, exclusively by
    /// compaction, so a snapshot never misses an append.
    pub(super) compaction_gate: RwLock<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, collaborators: Collaborators) -> io::Result<Self> {
        let (wal, recovery) = Wal::recover(&wal_path)?;
        let events = recovery.events;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            latest: LatestStateCache::new(),
            notify: collaborators.notify,
            agents: collaborators.agents,
            agent_client: collaborators.agent_client,
            agent_timeout: collaborators.agent_timeout,
            chunk_size: DEFAULT_CHUNK_SIZE,
            children: DashMap::new(),
            agent_resources: DashMap::new(),
            groups: DashMap::new(),
            compaction_gate: RwLock::new(()),
        };

        for event in &events {
            engine.replay_event(event);
        }
        metrics::gauge!(crate::observability::RESOURCES_ACTIVE).set(engine.state.len() as f64);
        info!(
            path = %wal_path.display(),
            events = events.len(),
            resources = engine.state.len(),
            groups = engine.groups.len(),
            "replayed availability log"
        );

        Ok(engine)
    }

    /// Reconcile up to `chunk_size` datums per lock acquisition and WAL record.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    // We're the sole owner of every Arc during replay, so try_write always
    // succeeds. Never use blocking_write here: this runs inside the runtime.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::ResourceCreated { info, seed } => {
                self.insert_timeline(Timeline::with_intervals(info.clone(), vec![seed.clone()]));
            }
            Event::ResourceRestored { info, intervals } => {
                self.insert_timeline(Timeline::with_intervals(info.clone(), intervals.clone()));
            }
            Event::ResourceDeleted { id } => {
                if let Some((_, shared)) = self.state.remove(id)
                    && let Ok(tl) = shared.try_read()
                {
                    self.unindex(&tl.info);
                }
                self.latest.remove(*id);
            }
            Event::TimelineChanged { changes } => {
                for change in changes {
                    let Some(shared) = self.get_resource(&change.resource_id) else {
                        warn!(resource_id = change.resource_id, "replay: change for unknown resource");
                        continue;
                    };
                    let Ok(mut tl) = shared.try_write() else {
                        continue;
                    };
                    for op in &change.ops {
                        tl.apply(op);
                    }
                    self.latest.set_latest(change.resource_id, tl.current_type());
                }
            }
            Event::GroupCreated { group } => {
                self.groups.insert(group.id, group.clone());
            }
            Event::GroupMembersSet { id, members } => {
                if let Some(mut group) = self.groups.get_mut(id) {
                    group.members = members.clone();
                }
            }
            Event::GroupDeleted { id } => {
                self.groups.remove(id);
            }
        }
    }

    /// Install a timeline and its index entries.
    pub(super) fn insert_timeline(&self, timeline: Timeline) {
        let info = timeline.info.clone();
        self.latest.set_latest(info.id, timeline.current_type());
        self.state.insert(info.id, Arc::new(RwLock::new(timeline)));
        if let Some(pid) = info.parent_id {
            self.children.entry(pid).or_default().push(info.id);
        }
        if let Some(agent_id) = info.agent_id {
            self.agent_resources.entry(agent_id).or_default().push(info.id);
        }
    }

    pub(super) fn unindex(&self, info: &ResourceInfo) {
        if let Some(pid) = info.parent_id
            && let Some(mut kids) = self.children.get_mut(&pid)
        {
            kids.retain(|c| *c != info.id);
        }
        if let Some(agent_id) = info.agent_id
            && let Some(mut owned) = self.agent_resources.get_mut(&agent_id)
        {
            owned.retain(|r| *r != info.id);
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_resource(&self, id: &ResourceId) -> Option<SharedTimeline> {
        self.state.get(id).map(|e| e.value().clone())
    }

    /// Lock `ids` in ascending order, run `plan` against a working copy of each
    /// timeline, commit every recorded op as one WAL record, then swap the
    /// copies in. Nothing is visible until the record is durable; on WAL
    /// failure the timelines are untouched.
    ///
    /// Returns the ids that do not exist.
    pub(super) async fn commit_locked<F>(
        &self,
        ids: &[ResourceId],
        mut plan: F,
    ) -> Result<Vec<ResourceId>, EngineError>
    where
        F: FnMut(&mut TimelineTxn<'_>),
    {
        let _gate = self.compaction_gate.read().await;
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut missing = Vec::new();
        let mut guards: Vec<OwnedRwLockWriteGuard<Timeline>> = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_resource(&id) {
                Some(shared) => guards.push(shared.write_owned().await),
                None => missing.push(id),
            }
        }

        let mut changes = Vec::new();
        let mut staged = Vec::new();
        for (idx, guard) in guards.iter().enumerate() {
            let mut working = (**guard).clone();
            let ops = {
                let mut txn = TimelineTxn::new(&mut working);
                plan(&mut txn);
                txn.into_ops()
            };
            if !ops.is_empty() {
                changes.push(TimelineChange {
                    resource_id: working.resource_id(),
                    ops,
                });
                staged.push((idx, working));
            }
        }

        if !changes.is_empty() {
            self.wal_append(&Event::TimelineChanged { changes }).await?;
            let mut retyped = Vec::new();
            for (idx, working) in staged {
                let (id, now_type) = (working.resource_id(), working.current_type());
                if self.latest.get_latest(id) != now_type {
                    retyped.push((id, now_type));
                }
                *guards[idx] = working;
            }
            // Only resources whose type moved touch the projection.
            for run in retyped.chunk_by(|a, b| a.1 == b.1) {
                let ids: Vec<ResourceId> = run.iter().map(|(id, _)| *id).collect();
                self.latest.set_latest_for_resources(&ids, run[0].1);
            }
        }
        Ok(missing)
    }
}
