//! Signed liveness beacons: fast-granularity peer health, replay and
//! clock-skew defenses, and timeout-driven status transitions.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

use crate::callbacks::HeartbeatObserver;
use crate::consensus::SlotConsensus;
use crate::pulse::PulseGenerator;
use crate::signer::{Signer, Verifier};

const SEQUENCE_RING_CAPACITY: usize = 1000;
const LATENCY_SAMPLE_CAPACITY: usize = 100;
const RECEIVED_LOG_CAPACITY: usize = 1000;
const CLOCK_SKEW_TOLERANCE_SECS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Unknown,
    Active,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: String,
    pub slot_number: u64,
    pub pulse_hash: [u8; 32],
    pub sequence: u64,
    pub timestamp: f64,
    pub region: String,
    pub signature: [u8; 64],
}

fn message_bytes(node_id: &str, slot_number: u64, pulse_hash: &[u8; 32], sequence: u64, timestamp: f64, region: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(node_id.len() + 8 + 32 + 8 + 8 + region.len());
    buf.extend_from_slice(node_id.as_bytes());
    buf.extend_from_slice(&slot_number.to_be_bytes());
    buf.extend_from_slice(pulse_hash);
    buf.extend_from_slice(&sequence.to_be_bytes());
    buf.extend_from_slice(&timestamp.to_be_bytes());
    buf.extend_from_slice(region.as_bytes());
    buf
}

impl Heartbeat {
    fn signed_bytes(&self) -> Vec<u8> {
        message_bytes(&self.node_id, self.slot_number, &self.pulse_hash, self.sequence, self.timestamp, &self.region)
    }
}

/// Per-peer liveness state as seen by this node.
pub struct NodeInfo {
    pub public_key: String,
    pub region: String,
    pub last_heartbeat: Option<Heartbeat>,
    pub last_seen: f64,
    pub status: NodeStatus,
    seen_sequences: VecDeque<u64>,
    seen_sequence_set: HashSet<u64>,
    latency_samples: VecDeque<f64>,
    pub avg_latency: f64,
}

impl NodeInfo {
    fn new(public_key: String, region: String) -> Self {
        Self {
            public_key,
            region,
            last_heartbeat: None,
            last_seen: 0.0,
            status: NodeStatus::Unknown,
            seen_sequences: VecDeque::with_capacity(SEQUENCE_RING_CAPACITY),
            seen_sequence_set: HashSet::new(),
            latency_samples: VecDeque::with_capacity(LATENCY_SAMPLE_CAPACITY),
            avg_latency: 0.0,
        }
    }

    fn record_sequence(&mut self, sequence: u64) {
        if self.seen_sequences.len() >= SEQUENCE_RING_CAPACITY {
            if let Some(evicted) = self.seen_sequences.pop_front() {
                self.seen_sequence_set.remove(&evicted);
            }
        }
        self.seen_sequences.push_back(sequence);
        self.seen_sequence_set.insert(sequence);
    }

    fn record_latency(&mut self, sample: f64) {
        if self.latency_samples.len() >= LATENCY_SAMPLE_CAPACITY {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(sample);
        self.avg_latency = self.latency_samples.iter().sum::<f64>() / self.latency_samples.len() as f64;
    }
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

pub struct HeartbeatProtocol {
    self_node_id: String,
    self_region: String,
    signer: Arc<dyn Signer>,
    verifier: Arc<dyn Verifier>,
    consensus: Arc<SlotConsensus>,
    pulse: Arc<PulseGenerator>,
    nodes: RwLock<HashMap<String, NodeInfo>>,
    received_log: RwLock<VecDeque<Heartbeat>>,
    sequence: AtomicU64,
    heartbeat_interval: Duration,
    node_timeout: Duration,
    observers: RwLock<Vec<Arc<dyn HeartbeatObserver>>>,
    running: Arc<AtomicBool>,
}

impl HeartbeatProtocol {
    pub fn new(
        self_node_id: impl Into<String>,
        self_region: impl Into<String>,
        signer: Arc<dyn Signer>,
        verifier: Arc<dyn Verifier>,
        consensus: Arc<SlotConsensus>,
        pulse: Arc<PulseGenerator>,
        heartbeat_interval: Duration,
        node_timeout: Duration,
    ) -> Self {
        Self {
            self_node_id: self_node_id.into(),
            self_region: self_region.into(),
            signer,
            verifier,
            consensus,
            pulse,
            nodes: RwLock::new(HashMap::new()),
            received_log: RwLock::new(VecDeque::with_capacity(RECEIVED_LOG_CAPACITY)),
            sequence: AtomicU64::new(0),
            heartbeat_interval,
            node_timeout,
            observers: RwLock::new(Vec::new()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn HeartbeatObserver>) {
        self.observers.write().push(observer);
    }

    pub fn register_peer(&self, node_id: impl Into<String>, public_key: impl Into<String>, region: impl Into<String>) {
        self.nodes.write().insert(node_id.into(), NodeInfo::new(public_key.into(), region.into()));
    }

    pub fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.nodes.read().get(node_id).map(|n| n.status)
    }

    /// Build and sign a heartbeat witnessing the node's current slot and
    /// pulse state.
    pub fn create_heartbeat(&self) -> Heartbeat {
        let slot_number = self.consensus.current_slot_number();
        let pulse_hash = self.pulse.latest().hash;
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let timestamp = now_secs();
        let bytes = message_bytes(&self.self_node_id, slot_number, &pulse_hash, sequence, timestamp, &self.self_region);
        let signature = self.signer.sign(&bytes);
        Heartbeat {
            node_id: self.self_node_id.clone(),
            slot_number,
            pulse_hash,
            sequence,
            timestamp,
            region: self.self_region.clone(),
            signature,
        }
    }

    /// Validate and, on success, apply a received heartbeat. Every
    /// rejection reason drops the record silently (with a warning log)
    /// rather than propagating an error.
    pub fn process_heartbeat(&self, hb: &Heartbeat) -> bool {
        let now = now_secs();
        if hb.timestamp > now + CLOCK_SKEW_TOLERANCE_SECS {
            tracing::warn!(node_id = %hb.node_id, timestamp = hb.timestamp, "heartbeat rejected: clock skew");
            return false;
        }

        let signed_bytes = hb.signed_bytes();
        let mut nodes = self.nodes.write();
        let Some(info) = nodes.get_mut(&hb.node_id) else {
            drop(nodes);
            tracing::warn!(node_id = %hb.node_id, "heartbeat rejected: unknown peer");
            return false;
        };

        if !self.verifier.verify(&info.public_key, &signed_bytes, &hb.signature) {
            tracing::warn!(node_id = %hb.node_id, "heartbeat rejected: signature verification failed");
            return false;
        }

        if info.seen_sequence_set.contains(&hb.sequence) {
            tracing::warn!(node_id = %hb.node_id, sequence = hb.sequence, "heartbeat rejected: replayed sequence");
            return false;
        }

        info.record_sequence(hb.sequence);
        info.last_seen = now;
        info.record_latency((now - hb.timestamp).max(0.0));
        info.last_heartbeat = Some(hb.clone());
        let became_active = info.status != NodeStatus::Active;
        info.status = NodeStatus::Active;
        drop(nodes);

        {
            let mut log = self.received_log.write();
            if log.len() >= RECEIVED_LOG_CAPACITY {
                log.pop_front();
            }
            log.push_back(hb.clone());
        }

        for observer in self.observers.read().iter() {
            observer.on_heartbeat(hb);
            if became_active {
                observer.on_status_change(&hb.node_id, NodeStatus::Active);
            }
        }
        true
    }

    /// Flip any peer whose `last_seen` exceeds `node_timeout` to the
    /// `timeout` status and fire the status-change callback once.
    pub fn check_timeouts(&self) {
        let now = now_secs();
        let timeout_secs = self.node_timeout.as_secs_f64();
        let mut transitioned = Vec::new();
        {
            let mut nodes = self.nodes.write();
            for (node_id, info) in nodes.iter_mut() {
                if info.status != NodeStatus::Timeout && now - info.last_seen > timeout_secs {
                    info.status = NodeStatus::Timeout;
                    transitioned.push(node_id.clone());
                }
            }
        }
        for node_id in transitioned {
            for observer in self.observers.read().iter() {
                observer.on_status_change(&node_id, NodeStatus::Timeout);
            }
        }
    }

    pub fn spawn_loops(self: &Arc<Self>) -> (mpsc::Receiver<Heartbeat>, tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        self.running.store(true, Ordering::SeqCst);

        let send_handle = {
            let this = Arc::clone(self);
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(this.heartbeat_interval);
                while this.running.load(Ordering::SeqCst) {
                    ticker.tick().await;
                    if !this.running.load(Ordering::SeqCst) {
                        break;
                    }
                    let hb = this.create_heartbeat();
                    if tx.send(hb).await.is_err() {
                        break;
                    }
                }
            })
        };

        let timeout_handle = {
            let this = Arc::clone(self);
            let interval = self.node_timeout / 2;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(50)));
                while this.running.load(Ordering::SeqCst) {
                    ticker.tick().await;
                    if !this.running.load(Ordering::SeqCst) {
                        break;
                    }
                    this.check_timeouts();
                }
            })
        };

        (rx, send_handle, timeout_handle)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::{Ed25519Signer, Ed25519Verifier};
    use std::time::Duration as StdDuration;

    fn protocol_with_peer(peer_signer: &Ed25519Signer) -> HeartbeatProtocol {
        let pulse = Arc::new(PulseGenerator::new(10_000.0));
        let consensus = Arc::new(SlotConsensus::new("self", Arc::clone(&pulse), StdDuration::from_millis(400), 40));
        let self_key_dir = std::env::temp_dir().join(format!("pulsecore-hb-{}", std::process::id()));
        let self_signer = Arc::new(Ed25519Signer::load_or_create("self", &self_key_dir.join("k.bin")).unwrap());
        let proto = HeartbeatProtocol::new(
            "self",
            "r1",
            self_signer,
            Arc::new(Ed25519Verifier),
            consensus,
            pulse,
            StdDuration::from_millis(100),
            StdDuration::from_secs(10),
        );
        proto.register_peer("peer", peer_signer.public_key_hex(), "r1");
        proto
    }

    #[test]
    fn s5_heartbeat_acceptance_and_replay_defense() {
        let key_dir = std::env::temp_dir().join(format!("pulsecore-hb-peer-{}", std::process::id()));
        let peer_signer = Ed25519Signer::load_or_create("peer", &key_dir.join("k.bin")).unwrap();
        let proto = protocol_with_peer(&peer_signer);

        let bytes = message_bytes("peer", 0, &[0u8; 32], 5, now_secs(), "r1");
        let sig = peer_signer.sign(&bytes);
        let hb = Heartbeat {
            node_id: "peer".into(),
            slot_number: 0,
            pulse_hash: [0u8; 32],
            sequence: 5,
            timestamp: now_secs(),
            region: "r1".into(),
            signature: sig,
        };

        assert!(proto.process_heartbeat(&hb));
        assert_eq!(proto.status_of("peer"), Some(NodeStatus::Active));

        assert!(!proto.process_heartbeat(&hb));

        let bytes6 = message_bytes("peer", 0, &[0u8; 32], 6, now_secs(), "r1");
        let mut sig6 = peer_signer.sign(&bytes6);
        sig6[0] ^= 0xFF;
        let hb6 = Heartbeat { sequence: 6, signature: sig6, ..hb };
        assert!(!proto.process_heartbeat(&hb6));
        let _ = std::fs::remove_dir_all(key_dir);
    }

    #[test]
    fn unknown_peer_rejected() {
        let key_dir = std::env::temp_dir().join(format!("pulsecore-hb-unk-{}", std::process::id()));
        let peer_signer = Ed25519Signer::load_or_create("ghost", &key_dir.join("k.bin")).unwrap();
        let pulse = Arc::new(PulseGenerator::new(10_000.0));
        let consensus = Arc::new(SlotConsensus::new("self", Arc::clone(&pulse), StdDuration::from_millis(400), 40));
        let self_signer = Arc::new(Ed25519Signer::load_or_create("self", &key_dir.join("self.bin")).unwrap());
        let proto = HeartbeatProtocol::new(
            "self",
            "r1",
            self_signer,
            Arc::new(Ed25519Verifier),
            consensus,
            pulse,
            StdDuration::from_millis(100),
            StdDuration::from_secs(10),
        );
        let bytes = message_bytes("ghost", 0, &[0u8; 32], 1, now_secs(), "r1");
        let sig = peer_signer.sign(&bytes);
        let hb = Heartbeat {
            node_id: "ghost".into(),
            slot_number: 0,
            pulse_hash: [0u8; 32],
            sequence: 1,
            timestamp: now_secs(),
            region: "r1".into(),
            signature: sig,
        };
        assert!(!proto.process_heartbeat(&hb));
        let _ = std::fs::remove_dir_all(key_dir);
    }

    #[test]
    fn future_timestamp_rejected() {
        let key_dir = std::env::temp_dir().join(format!("pulsecore-hb-skew-{}", std::process::id()));
        let peer_signer = Ed25519Signer::load_or_create("peer", &key_dir.join("k.bin")).unwrap();
        let proto = protocol_with_peer(&peer_signer);
        let future = now_secs() + 10.0;
        let bytes = message_bytes("peer", 0, &[0u8; 32], 1, future, "r1");
        let sig = peer_signer.sign(&bytes);
        let hb = Heartbeat {
            node_id: "peer".into(),
            slot_number: 0,
            pulse_hash: [0u8; 32],
            sequence: 1,
            timestamp: future,
            region: "r1".into(),
            signature: sig,
        };
        assert!(!proto.process_heartbeat(&hb));
        let _ = std::fs::remove_dir_all(key_dir);
    }
}
