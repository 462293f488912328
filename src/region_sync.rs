//! Region sync: the inter-region gossip plane. Broadcasts finalized-slot
//! summaries and region/node metadata to connected regions, deduplicates
//! inbound traffic, and serves chain-on-demand requests.

use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

use crate::consensus::SlotConsensus;
use crate::pulse::{PulseGenerator, PulseHash};
use crate::region::RegionManager;

const DEDUP_CAPACITY: usize = 10_000;
const DEDUP_COMPACT_TO: usize = 5_000;
const STALE_AFTER_SECS: f64 = 60.0;
const CHAIN_REQUEST_WINDOW: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessageType {
    PohSlot,
    PohChain,
    PohChainRequest,
    RegionInfo,
    NodeInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub source_region: String,
    pub target_region: String,
    pub message_type: SyncMessageType,
    pub data: serde_json::Value,
    pub timestamp: f64,
    pub message_id: String,
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

fn new_message_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct RegionSync {
    self_region: String,
    regions: Arc<RegionManager>,
    consensus: Arc<SlotConsensus>,
    pulse: Arc<PulseGenerator>,
    seen_ids: RwLock<VecDeque<String>>,
    seen_id_set: RwLock<HashSet<String>>,
    outbound: mpsc::Sender<SyncMessage>,
    sync_interval: Duration,
    tick_count: AtomicU64,
    running: Arc<AtomicBool>,
}

impl RegionSync {
    pub fn new(
        self_region: impl Into<String>,
        regions: Arc<RegionManager>,
        consensus: Arc<SlotConsensus>,
        pulse: Arc<PulseGenerator>,
        sync_interval: Duration,
    ) -> (Self, mpsc::Receiver<SyncMessage>) {
        let (tx, rx) = mpsc::channel(256);
        (
            Self {
                self_region: self_region.into(),
                regions,
                consensus,
                pulse,
                seen_ids: RwLock::new(VecDeque::new()),
                seen_id_set: RwLock::new(HashSet::new()),
                outbound: tx,
                sync_interval,
                tick_count: AtomicU64::new(0),
                running: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Enqueue one message per region connected to ours, optionally
    /// skipping a set of region ids.
    pub async fn broadcast(&self, message_type: SyncMessageType, payload: serde_json::Value, exclude: &HashSet<String>) {
        let Some(region) = self.regions.region(&self.self_region) else { return };
        for target in region.connected_regions.iter().filter(|r| !exclude.contains(*r)) {
            let msg = SyncMessage {
                source_region: self.self_region.clone(),
                target_region: target.clone(),
                message_type,
                data: payload.clone(),
                timestamp: now_secs(),
                message_id: new_message_id(),
            };
            let _ = self.outbound.send(msg).await;
        }
    }

    /// Validate that the target exists and is directly connected to our
    /// region before enqueueing a point-to-point message.
    pub async fn send(&self, msg: SyncMessage) -> bool {
        if self.regions.region(&msg.target_region).is_none() {
            tracing::warn!(target = %msg.target_region, "region sync send rejected: unknown target region");
            return false;
        }
        if !self.regions.are_connected(&self.self_region, &msg.target_region) {
            tracing::warn!(target = %msg.target_region, "region sync send rejected: not connected");
            return false;
        }
        self.outbound.send(msg).await.is_ok()
    }

    fn mark_seen(&self, message_id: &str) -> bool {
        let mut set = self.seen_id_set.write();
        if !set.insert(message_id.to_string()) {
            return false;
        }
        let mut ids = self.seen_ids.write();
        ids.push_back(message_id.to_string());
        if ids.len() > DEDUP_CAPACITY {
            while ids.len() > DEDUP_COMPACT_TO {
                if let Some(evicted) = ids.pop_front() {
                    set.remove(&evicted);
                }
            }
        }
        true
    }

    /// Validate, dedup, and dispatch one inbound message. All rejections
    /// log at warning and return `false`; a duplicate `message_id`
    /// produces exactly one handler invocation across repeated delivery.
    pub async fn process_message(&self, msg: &SyncMessage) -> bool {
        if msg.target_region != self.self_region {
            tracing::warn!(target = %msg.target_region, "region sync message rejected: wrong target");
            return false;
        }
        if !self.regions.are_connected(&self.self_region, &msg.source_region) {
            tracing::warn!(source = %msg.source_region, "region sync message rejected: source not connected");
            return false;
        }
        let age = now_secs() - msg.timestamp;
        if age > STALE_AFTER_SECS {
            tracing::warn!(age_secs = age, "region sync message rejected: stale");
            return false;
        }
        if !self.mark_seen(&msg.message_id) {
            return false;
        }

        match msg.message_type {
            SyncMessageType::PohSlot => self.handle_poh_slot(msg).await,
            SyncMessageType::PohChain => self.handle_poh_chain(msg),
            SyncMessageType::PohChainRequest => self.handle_poh_chain_request(msg).await,
            SyncMessageType::RegionInfo => self.handle_region_info(msg),
            SyncMessageType::NodeInfo => self.handle_node_info(msg),
        }
        true
    }

    async fn handle_poh_slot(&self, msg: &SyncMessage) {
        let Some(slot_number) = msg.data.get("slot_number").and_then(|v| v.as_u64()) else { return };
        if self.consensus.is_finalized(slot_number) {
            return;
        }
        let start = slot_number.saturating_sub(CHAIN_REQUEST_WINDOW);
        let request = SyncMessage {
            source_region: self.self_region.clone(),
            target_region: msg.source_region.clone(),
            message_type: SyncMessageType::PohChainRequest,
            data: serde_json::json!({ "start": start, "end": slot_number }),
            timestamp: now_secs(),
            message_id: new_message_id(),
        };
        let _ = self.send(request).await;
    }

    async fn handle_poh_chain_request(&self, msg: &SyncMessage) {
        let start = msg.data.get("start").and_then(|v| v.as_u64()).unwrap_or(0);
        let end = msg.data.get("end").and_then(|v| v.as_u64()).unwrap_or(start);
        let count = end.saturating_sub(start) + 1;
        let chain = self.pulse.export(start, count);
        let Ok(payload) = serde_json::to_value(&chain) else { return };
        let reply = SyncMessage {
            source_region: self.self_region.clone(),
            target_region: msg.source_region.clone(),
            message_type: SyncMessageType::PohChain,
            data: payload,
            timestamp: now_secs(),
            message_id: new_message_id(),
        };
        let _ = self.send(reply).await;
    }

    /// Validate the supplied chain and merge it without demoting any
    /// slot this node has already finalized locally — finalization
    /// state lives entirely in slot consensus, which this handler never
    /// touches, so importing a chain segment can only extend the local
    /// pulse ring, never roll it back.
    fn handle_poh_chain(&self, msg: &SyncMessage) {
        let Ok(chain) = serde_json::from_value::<Vec<PulseHash>>(msg.data.clone()) else {
            tracing::warn!("region sync: malformed poh_chain payload");
            return;
        };
        if let Err(e) = self.pulse.import(&chain) {
            tracing::warn!(error = %e, "region sync: poh_chain import rejected");
        }
    }

    fn handle_region_info(&self, msg: &SyncMessage) {
        let Some(region_id) = msg.data.get("region_id").and_then(|v| v.as_str()) else { return };
        let name = msg.data.get("name").and_then(|v| v.as_str()).unwrap_or(region_id);
        self.regions.create_region(region_id, name);
        if !self.regions.are_connected(&self.self_region, region_id) {
            self.regions.connect_regions(&self.self_region, region_id);
        }
    }

    fn handle_node_info(&self, msg: &SyncMessage) {
        let Some(nodes) = msg.data.get("nodes").and_then(|v| v.as_array()) else { return };
        for node in nodes {
            let Some(node_id) = node.get("node_id").and_then(|v| v.as_str()) else { continue };
            let Some(primary) = node.get("primary_region").and_then(|v| v.as_str()) else { continue };
            self.regions.register_node(node_id, primary);
            if let Some(secondaries) = node.get("secondary_regions").and_then(|v| v.as_array()) {
                for s in secondaries {
                    if let Some(region_id) = s.as_str() {
                        self.regions.add_secondary_region(node_id, region_id);
                    }
                }
            }
        }
    }

    async fn emit_cadence(&self) {
        let tick = self.tick_count.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(slot) = self.consensus.latest_finalized() {
            self.broadcast(
                SyncMessageType::PohSlot,
                serde_json::json!({ "slot_number": slot.slot_number, "leader_id": slot.leader_id }),
                &HashSet::new(),
            )
            .await;
        }

        if tick % 5 == 0 {
            if let Some(region) = self.regions.region(&self.self_region) {
                self.broadcast(
                    SyncMessageType::RegionInfo,
                    serde_json::json!({ "region_id": region.region_id, "name": region.name }),
                    &HashSet::new(),
                )
                .await;
            }
        }

        if tick % 10 == 0 {
            let nodes = self.regions.local_nodes(&self.self_region);
            let Ok(payload) = serde_json::to_value(&nodes) else { return };
            self.broadcast(SyncMessageType::NodeInfo, serde_json::json!({ "nodes": payload }), &HashSet::new())
                .await;
        }
    }

    pub fn spawn_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        this.running.store(true, Ordering::SeqCst);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.sync_interval);
            while this.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                this.emit_cadence().await;
            }
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn harness(self_region: &str) -> (Arc<RegionSync>, mpsc::Receiver<SyncMessage>, Arc<RegionManager>, Arc<SlotConsensus>, Arc<PulseGenerator>) {
        let regions = Arc::new(RegionManager::new());
        regions.create_region(self_region, self_region);
        let pulse = Arc::new(PulseGenerator::new(10_000.0));
        let consensus = Arc::new(SlotConsensus::new("self", Arc::clone(&pulse), StdDuration::from_millis(400), 40));
        let (sync, rx) = RegionSync::new(self_region, Arc::clone(&regions), Arc::clone(&consensus), Arc::clone(&pulse), StdDuration::from_secs(1));
        (Arc::new(sync), rx, regions, consensus, pulse)
    }

    #[tokio::test]
    async fn s9_duplicate_message_id_dispatches_once() {
        let (sync, _rx, regions, _consensus, _pulse) = harness("R2");
        regions.create_region("R1", "R1");
        regions.connect_regions("R1", "R2");

        let msg = SyncMessage {
            source_region: "R1".into(),
            target_region: "R2".into(),
            message_type: SyncMessageType::RegionInfo,
            data: serde_json::json!({ "region_id": "R3", "name": "R3" }),
            timestamp: now_secs(),
            message_id: "dupe0000".into(),
        };
        assert!(sync.process_message(&msg).await);
        assert!(!sync.process_message(&msg).await);
        assert!(regions.region("R3").is_some());
    }

    #[tokio::test]
    async fn stale_message_rejected() {
        let (sync, _rx, regions, _c, _p) = harness("R2");
        regions.create_region("R1", "R1");
        regions.connect_regions("R1", "R2");
        let msg = SyncMessage {
            source_region: "R1".into(),
            target_region: "R2".into(),
            message_type: SyncMessageType::RegionInfo,
            data: serde_json::json!({}),
            timestamp: now_secs() - 120.0,
            message_id: "stale000".into(),
        };
        assert!(!sync.process_message(&msg).await);
    }

    #[tokio::test]
    async fn s7_poh_slot_triggers_chain_request_and_import() {
        let (sync_b, mut rx_b, regions_b, consensus_b, pulse_b) = harness("R2");
        regions_b.create_region("R1", "R1");
        regions_b.connect_regions("R1", "R2");

        let pulse_a = Arc::new(PulseGenerator::new(10_000.0));
        for _ in 0..5 {
            pulse_a.next(None);
        }

        let slot_msg = SyncMessage {
            source_region: "R1".into(),
            target_region: "R2".into(),
            message_type: SyncMessageType::PohSlot,
            data: serde_json::json!({ "slot_number": 5, "leader_id": "a" }),
            timestamp: now_secs(),
            message_id: "slotmsg0".into(),
        };
        assert!(sync_b.process_message(&slot_msg).await);

        let request = rx_b.recv().await.unwrap();
        assert_eq!(request.message_type, SyncMessageType::PohChainRequest);
        assert_eq!(request.target_region, "R1");

        let start = request.data["start"].as_u64().unwrap();
        let end = request.data["end"].as_u64().unwrap();
        let chain = pulse_a.export(start, end - start + 1);
        let chain_msg = SyncMessage {
            source_region: "R1".into(),
            target_region: "R2".into(),
            message_type: SyncMessageType::PohChain,
            data: serde_json::to_value(&chain).unwrap(),
            timestamp: now_secs(),
            message_id: "chainmsg".into(),
        };
        assert!(sync_b.process_message(&chain_msg).await);
        assert_eq!(pulse_b.latest().hash, pulse_a.latest().hash);
        let _ = consensus_b.latest_finalized();
    }
}
