use dashmap::DashMap;

use crate::model::{AvailabilityType, ResourceId};

/// Last known availability type per resource, for cheap "what is it now" reads.
/// Kept in step with each timeline's open interval by the engine.
pub struct LatestStateCache {
    types: DashMap<ResourceId, AvailabilityType>,
}

impl Default for LatestStateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl LatestStateCache {
    pub fn new() -> Self {
        Self {
            types: DashMap::new(),
        }
    }

    /// UNKNOWN for resources never seen.
    pub fn get_latest(&self, resource_id: ResourceId) -> AvailabilityType {
        self.types
            .get(&resource_id)
            .map_or(AvailabilityType::Unknown, |t| *t)
    }

    /// Returns true if the stored value changed.
    pub fn set_latest(&self, resource_id: ResourceId, avail_type: AvailabilityType) -> bool {
        match self.types.insert(resource_id, avail_type) {
            Some(previous) => previous != avail_type,
            None => true,
        }
    }

    /// Returns how many entries changed.
    pub fn set_latest_for_resources(
        &self,
        resource_ids: &[ResourceId],
        avail_type: AvailabilityType,
    ) -> usize {
        resource_ids
            .iter()
            .filter(|id| self.set_latest(**id, avail_type))
            .count()
    }

    pub fn remove(&self, resource_id: ResourceId) {
        self.types.remove(&resource_id);
    }
}
