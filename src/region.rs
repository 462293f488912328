//! Region manager: the membership graph nodes belong to, and the
//! deterministic coordinator each region elects from its active nodes.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::callbacks::RegionObserver;

pub type CoordinatorId = String;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const INACTIVITY_TIMEOUT_SECS: f64 = 60.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionInfo {
    pub region_id: String,
    pub name: String,
    pub coordinator_id: Option<CoordinatorId>,
    pub active_nodes: BTreeSet<String>,
    pub connected_regions: HashSet<String>,
}

impl RegionInfo {
    fn new(region_id: String, name: String) -> Self {
        Self {
            region_id,
            name,
            coordinator_id: None,
            active_nodes: BTreeSet::new(),
            connected_regions: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: String,
    pub primary_region: String,
    pub secondary_regions: Vec<String>,
}

struct NodeMembership {
    primary_region: String,
    secondary_regions: HashSet<String>,
    last_active: f64,
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

pub struct RegionManager {
    regions: RwLock<HashMap<String, RegionInfo>>,
    nodes: RwLock<HashMap<String, NodeMembership>>,
    observers: RwLock<Vec<Arc<dyn RegionObserver>>>,
    running: Arc<AtomicBool>,
}

impl RegionManager {
    pub fn new() -> Self {
        Self {
            regions: RwLock::new(HashMap::new()),
            nodes: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn RegionObserver>) {
        self.observers.write().push(observer);
    }

    pub fn create_region(&self, region_id: impl Into<String>, name: impl Into<String>) {
        let region_id = region_id.into();
        self.regions
            .write()
            .entry(region_id.clone())
            .or_insert_with(|| RegionInfo::new(region_id, name.into()));
    }

    /// Re-run the lexicographic-smallest-id election for one region,
    /// firing `coordinator_change` (including to `None`) when the
    /// outcome differs from the currently recorded coordinator.
    fn elect_coordinator(&self, region_id: &str) {
        let changed = {
            let mut regions = self.regions.write();
            let Some(region) = regions.get_mut(region_id) else { return };
            let elected = region.active_nodes.iter().next().cloned();
            if elected == region.coordinator_id {
                None
            } else {
                region.coordinator_id = elected.clone();
                Some(elected)
            }
        };
        if let Some(new_coordinator) = changed {
            for observer in self.observers.read().iter() {
                observer.on_coordinator_change(region_id, new_coordinator.as_ref());
            }
        }
    }

    /// Register `node_id` into `region` as its primary. Moves the node
    /// (firing a region-change callback) if it already had a different
    /// primary region, re-electing both the vacated and new region's
    /// coordinator as membership changes.
    pub fn register_node(&self, node_id: impl Into<String>, region: impl Into<String>) {
        let node_id = node_id.into();
        let region = region.into();
        self.create_region(&region, &region);

        let previous = {
            let mut nodes = self.nodes.write();
            let entry = nodes.entry(node_id.clone()).or_insert_with(|| NodeMembership {
                primary_region: region.clone(),
                secondary_regions: HashSet::new(),
                last_active: now_secs(),
            });
            let previous = if entry.primary_region != region {
                Some(entry.primary_region.clone())
            } else {
                None
            };
            entry.primary_region = region.clone();
            entry.last_active = now_secs();
            previous
        };

        if let Some(old_region) = &previous {
            if let Some(r) = self.regions.write().get_mut(old_region) {
                r.active_nodes.remove(&node_id);
            }
            self.elect_coordinator(old_region);
        }

        if let Some(r) = self.regions.write().get_mut(&region) {
            r.active_nodes.insert(node_id.clone());
        }
        if previous.is_some() {
            for observer in self.observers.read().iter() {
                observer.on_region_change(&node_id, previous.as_deref(), &region);
            }
        }
        self.elect_coordinator(&region);
    }

    /// Refresh a node's last-active timestamp without changing region
    /// membership, used to keep it out of the inactivity sweep.
    pub fn touch(&self, node_id: &str) {
        if let Some(m) = self.nodes.write().get_mut(node_id) {
            m.last_active = now_secs();
        }
    }

    /// Remove `node_id` from its primary and every secondary region,
    /// re-electing coordinators for every region it vacated.
    pub fn unregister_node(&self, node_id: &str) {
        let Some(membership) = self.nodes.write().remove(node_id) else { return };
        let mut affected = vec![membership.primary_region.clone()];
        affected.extend(membership.secondary_regions.iter().cloned());

        let mut regions = self.regions.write();
        for region_id in &affected {
            if let Some(region) = regions.get_mut(region_id) {
                region.active_nodes.remove(node_id);
            }
        }
        drop(regions);

        for region_id in &affected {
            self.elect_coordinator(region_id);
        }
    }

    pub fn add_secondary_region(&self, node_id: &str, region_id: impl Into<String>) {
        let region_id = region_id.into();
        self.create_region(&region_id, &region_id);
        let added = {
            let mut nodes = self.nodes.write();
            match nodes.get_mut(node_id) {
                Some(m) => m.secondary_regions.insert(region_id.clone()),
                None => return,
            }
        };
        if added {
            if let Some(r) = self.regions.write().get_mut(&region_id) {
                r.active_nodes.insert(node_id.to_string());
            }
            self.elect_coordinator(&region_id);
        }
    }

    pub fn remove_secondary_region(&self, node_id: &str, region_id: &str) {
        let (removed, still_primary) = {
            let mut nodes = self.nodes.write();
            match nodes.get_mut(node_id) {
                Some(m) => (m.secondary_regions.remove(region_id), m.primary_region == region_id),
                None => return,
            }
        };
        if removed && !still_primary {
            if let Some(r) = self.regions.write().get_mut(region_id) {
                r.active_nodes.remove(node_id);
            }
            self.elect_coordinator(region_id);
        }
    }

    /// Symmetric connection between two distinct, existing regions.
    pub fn connect_regions(&self, a: &str, b: &str) -> bool {
        if a == b {
            return false;
        }
        let mut regions = self.regions.write();
        if !regions.contains_key(a) || !regions.contains_key(b) {
            return false;
        }
        regions.get_mut(a).unwrap().connected_regions.insert(b.to_string());
        regions.get_mut(b).unwrap().connected_regions.insert(a.to_string());
        true
    }

    pub fn disconnect_regions(&self, a: &str, b: &str) -> bool {
        let mut regions = self.regions.write();
        let mut changed = false;
        if let Some(r) = regions.get_mut(a) {
            changed |= r.connected_regions.remove(b);
        }
        if let Some(r) = regions.get_mut(b) {
            changed |= r.connected_regions.remove(a);
        }
        changed
    }

    pub fn region(&self, region_id: &str) -> Option<RegionInfo> {
        self.regions.read().get(region_id).cloned()
    }

    pub fn are_connected(&self, a: &str, b: &str) -> bool {
        self.regions.read().get(a).map(|r| r.connected_regions.contains(b)).unwrap_or(false)
    }

    pub fn coordinator_of(&self, region_id: &str) -> Option<CoordinatorId> {
        self.regions.read().get(region_id).and_then(|r| r.coordinator_id.clone())
    }

    /// Every node whose primary region is `region_id`, with its full
    /// membership (primary plus secondaries) — used by region sync's
    /// periodic `node_info` batch.
    pub fn local_nodes(&self, region_id: &str) -> Vec<NodeDescriptor> {
        self.nodes
            .read()
            .iter()
            .filter(|(_, m)| m.primary_region == region_id)
            .map(|(id, m)| NodeDescriptor {
                node_id: id.clone(),
                primary_region: m.primary_region.clone(),
                secondary_regions: m.secondary_regions.iter().cloned().collect(),
            })
            .collect()
    }

    /// Unregister any node inactive beyond the 60s window and re-elect
    /// any region that lacks a coordinator despite having active nodes.
    pub fn sweep(&self) {
        let cutoff = now_secs() - INACTIVITY_TIMEOUT_SECS;
        let stale: Vec<String> = self
            .nodes
            .read()
            .iter()
            .filter(|(_, m)| m.last_active < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for node_id in stale {
            self.unregister_node(&node_id);
        }

        let needs_election: Vec<String> = self
            .regions
            .read()
            .values()
            .filter(|r| r.coordinator_id.is_none() && !r.active_nodes.is_empty())
            .map(|r| r.region_id.clone())
            .collect();
        for region_id in needs_election {
            self.elect_coordinator(&region_id);
        }
    }

    pub fn spawn_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        this.running.store(true, Ordering::SeqCst);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            while this.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                this.sweep();
            }
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Default for RegionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s6_region_coordinator_lex_smallest_and_reelection() {
        let rm = RegionManager::new();
        rm.create_region("R1", "Region One");
        rm.create_region("R2", "Region Two");

        rm.register_node("n3", "R1");
        rm.register_node("n1", "R1");
        rm.register_node("n2", "R1");
        assert_eq!(rm.coordinator_of("R1"), Some("n1".to_string()));

        rm.unregister_node("n1");
        assert_eq!(rm.coordinator_of("R1"), Some("n2".to_string()));
    }

    #[test]
    fn coordinator_goes_to_none_when_region_empties() {
        let rm = RegionManager::new();
        rm.create_region("R1", "Region One");
        rm.register_node("solo", "R1");
        assert_eq!(rm.coordinator_of("R1"), Some("solo".to_string()));
        rm.unregister_node("solo");
        assert_eq!(rm.coordinator_of("R1"), None);
    }

    #[test]
    fn moving_primary_region_fires_and_reelects_both_sides() {
        let rm = RegionManager::new();
        rm.create_region("R1", "R1");
        rm.create_region("R2", "R2");
        rm.register_node("n1", "R1");
        rm.register_node("n1", "R2");
        assert_eq!(rm.coordinator_of("R1"), None);
        assert_eq!(rm.coordinator_of("R2"), Some("n1".to_string()));
    }

    #[test]
    fn self_connection_rejected() {
        let rm = RegionManager::new();
        rm.create_region("R1", "R1");
        assert!(!rm.connect_regions("R1", "R1"));
    }

    #[test]
    fn connection_is_symmetric() {
        let rm = RegionManager::new();
        rm.create_region("R1", "R1");
        rm.create_region("R2", "R2");
        assert!(rm.connect_regions("R1", "R2"));
        assert!(rm.are_connected("R1", "R2"));
        assert!(rm.are_connected("R2", "R1"));
    }
}
