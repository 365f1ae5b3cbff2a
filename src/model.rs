use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub type ResourceId = u64;
pub type AgentId = u64;
pub type GroupId = u64;

/// Status of a monitored resource over some stretch of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AvailabilityType {
    Up,
    Down,
    Disabled,
    Unknown,
}

impl AvailabilityType {
    pub fn label(&self) -> &'static str {
        match self {
            AvailabilityType::Up => "up",
            AvailabilityType::Down => "down",
            AvailabilityType::Disabled => "disabled",
            AvailabilityType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for AvailabilityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One run of a single availability type on one resource: `[start, end)`.
/// `end == None` marks the open interval, i.e. the resource's current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub id: Ulid,
    pub resource_id: ResourceId,
    pub start: Ms,
    pub end: Option<Ms>,
    pub avail_type: AvailabilityType,
}

impl Availability {
    pub fn open(resource_id: ResourceId, start: Ms, avail_type: AvailabilityType) -> Self {
        Self {
            id: Ulid::new(),
            resource_id,
            start,
            end: None,
            avail_type,
        }
    }

    pub fn closed(resource_id: ResourceId, start: Ms, end: Ms, avail_type: AvailabilityType) -> Self {
        debug_assert!(start < end, "closed interval must have positive width");
        Self {
            id: Ulid::new(),
            resource_id,
            start,
            end: Some(end),
            avail_type,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// Half-open containment; an open interval contains every `t >= start`.
    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && self.end.is_none_or(|end| t < end)
    }
}

/// One summarized bucket. `avail_type == None` only when there is nothing to
/// derive a status from at all (e.g. the live value of an empty group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityPoint {
    pub avail_type: Option<AvailabilityType>,
    /// Start of the bucket.
    pub timestamp: Ms,
}

/// A single observation inside an agent report. The end time is never
/// reported; the reconciler derives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportDatum {
    pub resource_id: Option<ResourceId>,
    pub start: Ms,
    pub avail_type: AvailabilityType,
}

impl ReportDatum {
    pub fn new(resource_id: ResourceId, start: Ms, avail_type: AvailabilityType) -> Self {
        Self {
            resource_id: Some(resource_id),
            start,
            avail_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityReport {
    /// `None` for reports the server builds itself (e.g. re-enabling resources).
    pub agent_id: Option<AgentId>,
    /// Delta report: only resources whose status changed are listed.
    pub changes_only: bool,
    /// Sent solely to re-enable disabled resources.
    pub enablement: bool,
    pub data: Vec<ReportDatum>,
}

impl AvailabilityReport {
    pub fn full(agent_id: AgentId, data: Vec<ReportDatum>) -> Self {
        Self {
            agent_id: Some(agent_id),
            changes_only: false,
            enablement: false,
            data,
        }
    }

    pub fn changes_only(agent_id: AgentId, data: Vec<ReportDatum>) -> Self {
        Self {
            agent_id: Some(agent_id),
            changes_only: true,
            enablement: false,
            data,
        }
    }

    pub fn enablement(data: Vec<ReportDatum>) -> Self {
        Self {
            agent_id: None,
            changes_only: false,
            enablement: true,
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    /// False when the report was skipped without touching any timeline.
    pub accepted: bool,
    /// The originating agent should be asked for a full report.
    pub resync_requested: bool,
}

/// What a bucketed availability query is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Context {
    Resource(ResourceId),
    Group(GroupId),
    /// All children of `parent_id` with the given resource type.
    AutoGroup {
        parent_id: ResourceId,
        resource_type: String,
    },
}

impl Context {
    pub fn label(&self) -> &'static str {
        match self {
            Context::Resource(_) => "resource",
            Context::Group(_) => "group",
            Context::AutoGroup { .. } => "autogroup",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: ResourceId,
    /// Parentless resources are platforms.
    pub parent_id: Option<ResourceId>,
    /// Agent that monitors this resource.
    pub agent_id: Option<AgentId>,
    pub resource_type: Option<String>,
    pub name: Option<String>,
}

impl ResourceInfo {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            parent_id: None,
            agent_id: None,
            resource_type: None,
            name: None,
        }
    }

    pub fn with_parent(mut self, parent_id: ResourceId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    pub fn is_platform(&self) -> bool {
        self.parent_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub id: GroupId,
    pub name: Option<String>,
    /// Sorted, no duplicates.
    pub members: Vec<ResourceId>,
}

/// A single recorded mutation of one resource's timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimelineOp {
    Append(Availability),
    SetEnd { id: Ulid, end: Option<Ms> },
    SetStart { id: Ulid, start: Ms },
    SetType { id: Ulid, avail_type: AvailabilityType },
    Remove { id: Ulid },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineChange {
    pub resource_id: ResourceId,
    pub ops: Vec<TimelineOp>,
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        info: ResourceInfo,
        /// The UNKNOWN interval every resource starts with.
        seed: Availability,
    },
    /// Full snapshot of a resource, written by compaction.
    ResourceRestored {
        info: ResourceInfo,
        intervals: Vec<Availability>,
    },
    ResourceDeleted {
        id: ResourceId,
    },
    /// One reconciled chunk; applied entirely or not at all.
    TimelineChanged {
        changes: Vec<TimelineChange>,
    },
    GroupCreated {
        group: GroupInfo,
    },
    GroupMembersSet {
        id: GroupId,
        members: Vec<ResourceId>,
    },
    GroupDeleted {
        id: GroupId,
    },
}
