//! Narrow event interfaces for cross-component notification.
//!
//! Each trait here is a one-way subscriber interface: a publisher holds a
//! list of `Arc<dyn Trait>` and calls every subscriber after releasing its
//! own lock (release-before-dispatch). Subscribers never hold a reference
//! back to the publisher, so no component pair can form an ownership cycle
//! through its callbacks.

use crate::consensus::Slot;
use crate::heartbeat::{Heartbeat, NodeStatus};
use crate::region::CoordinatorId;

/// Subscriber to slot-consensus lifecycle events.
pub trait ConsensusObserver: Send + Sync {
    /// A new slot was created (leader selected, start_counter recorded).
    fn on_new_slot(&self, slot: &Slot) {
        let _ = slot;
    }

    /// A slot crossed quorum and was finalized.
    fn on_slot_finalized(&self, slot: &Slot) {
        let _ = slot;
    }
}

/// Subscriber to heartbeat protocol events.
pub trait HeartbeatObserver: Send + Sync {
    /// A heartbeat was accepted from a sender.
    fn on_heartbeat(&self, hb: &Heartbeat) {
        let _ = hb;
    }

    /// A peer's liveness status changed (e.g. active -> timeout).
    fn on_status_change(&self, node_id: &str, status: NodeStatus) {
        let _ = (node_id, status);
    }
}

/// Subscriber to region membership events.
pub trait RegionObserver: Send + Sync {
    /// A node's primary region changed.
    fn on_region_change(&self, node_id: &str, old_region: Option<&str>, new_region: &str) {
        let _ = (node_id, old_region, new_region);
    }

    /// A region's elected coordinator changed (`None` when the region became empty).
    fn on_coordinator_change(&self, region_id: &str, coordinator: Option<&CoordinatorId>) {
        let _ = (region_id, coordinator);
    }
}

/// Subscriber to environmental data collection events.
pub trait EnvObserver: Send + Sync {
    /// A fused payload was produced and injected into the pulse.
    fn on_data_collected(&self, payload: &serde_json::Value) {
        let _ = payload;
    }
}

/// No-op implementation usable as a default subscriber or in tests.
pub struct NullObserver;

impl ConsensusObserver for NullObserver {}
impl HeartbeatObserver for NullObserver {}
impl RegionObserver for NullObserver {}
impl EnvObserver for NullObserver {}
