use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Availability, ResourceId};

const CHANNEL_CAPACITY: usize = 256;

/// Intervals whose type changed while processing one report.
pub type ChangeBatch = Arc<[Availability]>;

/// Broadcast hub feeding alerting: one batch per processed report, plus
/// per-resource channels.
pub struct NotifyHub {
    batches: broadcast::Sender<ChangeBatch>,
    channels: DashMap<ResourceId, broadcast::Sender<Availability>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            batches: broadcast::channel(CHANNEL_CAPACITY).0,
            channels: DashMap::new(),
        }
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<ChangeBatch> {
        self.batches.subscribe()
    }

    /// Subscribe to changes of one resource. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: ResourceId) -> broadcast::Receiver<Availability> {
        let sender = self
            .channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish one report's changes. No-op if empty or nobody is listening.
    pub fn publish(&self, changed: Vec<Availability>) {
        if changed.is_empty() {
            return;
        }
        for a in &changed {
            if let Some(sender) = self.channels.get(&a.resource_id) {
                let _ = sender.send(a.clone());
            }
        }
        let _ = self.batches.send(changed.into());
    }

    /// Drop a resource's channel (e.g. when the resource is deleted).
    pub fn remove(&self, resource_id: ResourceId) {
        self.channels.remove(&resource_id);
    }
}
