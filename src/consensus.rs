//! Slot consensus: carves the pulse sequence into slots, elects a leader
//! per slot by weighted stake-and-performance sampling, and finalizes
//! slots once a quorum of validators confirm them.

use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::callbacks::ConsensusObserver;
use crate::pulse::PulseGenerator;

pub type SlotNumber = u64;

const FINALIZED_RING_CAPACITY: usize = 1000;
const PERFORMANCE_MIN: f64 = 0.5;
const PERFORMANCE_MAX: f64 = 1.5;
const STREAK_DECAY_THRESHOLD: u32 = 3;

/// A registered block producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leader {
    pub node_id: String,
    pub public_key: String,
    pub region: String,
    pub stake: f64,
    pub performance_score: f64,
    pub last_leader_slot: Option<SlotNumber>,
    pub consecutive_slots: u32,
}

impl Leader {
    fn new(node_id: String, public_key: String, region: String, stake: f64) -> Self {
        Self {
            node_id,
            public_key,
            region,
            stake: stake.max(0.0),
            performance_score: 1.0,
            last_leader_slot: None,
            consecutive_slots: 0,
        }
    }

    fn weight(&self) -> f64 {
        self.stake * self.performance_score
    }
}

/// A segment of the timeline owned by a leader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    pub slot_number: SlotNumber,
    pub start_counter: u64,
    pub end_counter: Option<u64>,
    pub leader_id: String,
    pub is_leader: bool,
    pub start_time: f64,
    pub end_time: Option<f64>,
    pub confirmations: HashSet<String>,
    pub is_finalized: bool,
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// Seed the per-slot PRNG from the current pulse hash and slot number,
/// so leader selection is reproducible given the same chain state.
fn seed_for(pulse_hash: &[u8; 32], slot_number: SlotNumber) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(pulse_hash);
    hasher.update(slot_number.to_le_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[0..8].try_into().unwrap())
}

pub struct SlotConsensus {
    self_node_id: String,
    pulse: Arc<PulseGenerator>,
    leaders: RwLock<BTreeMap<String, Leader>>,
    validators: RwLock<HashSet<String>>,
    current_slot_number: RwLock<SlotNumber>,
    previous_leader: RwLock<Option<String>>,
    open_slots: RwLock<BTreeMap<SlotNumber, Slot>>,
    finalized_slots: RwLock<VecDeque<Slot>>,
    target_hashes_per_slot: u64,
    slot_duration: Duration,
    observers: RwLock<Vec<Arc<dyn ConsensusObserver>>>,
    running: Arc<AtomicBool>,
}

impl SlotConsensus {
    pub fn new(self_node_id: impl Into<String>, pulse: Arc<PulseGenerator>, slot_duration: Duration, target_hashes_per_slot: u64) -> Self {
        Self {
            self_node_id: self_node_id.into(),
            pulse,
            leaders: RwLock::new(BTreeMap::new()),
            validators: RwLock::new(HashSet::new()),
            current_slot_number: RwLock::new(0),
            previous_leader: RwLock::new(None),
            open_slots: RwLock::new(BTreeMap::new()),
            finalized_slots: RwLock::new(VecDeque::with_capacity(FINALIZED_RING_CAPACITY)),
            target_hashes_per_slot,
            slot_duration,
            observers: RwLock::new(Vec::new()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn ConsensusObserver>) {
        self.observers.write().push(observer);
    }

    pub fn register_leader(&self, node_id: impl Into<String>, public_key: impl Into<String>, region: impl Into<String>, stake: f64) {
        let node_id = node_id.into();
        let mut leaders = self.leaders.write();
        leaders
            .entry(node_id.clone())
            .and_modify(|l| {
                l.public_key = public_key.into();
                l.region = region.into();
                l.stake = stake.max(0.0);
            })
            .or_insert_with(|| Leader::new(node_id, public_key.into(), region.into(), stake));
    }

    pub fn register_validator(&self, node_id: impl Into<String>) {
        self.validators.write().insert(node_id.into());
    }

    /// Deterministic weighted leader selection for `slot_number`. Falls
    /// back to this node when no leader is registered.
    pub fn select_leader(&self, slot_number: SlotNumber) -> String {
        let leaders = self.leaders.read();
        if leaders.is_empty() {
            return self.self_node_id.clone();
        }

        let latest = self.pulse.latest();
        let seed = seed_for(&latest.hash, slot_number);
        let mut rng = StdRng::seed_from_u64(seed);

        let total_weight: f64 = leaders.values().map(Leader::weight).sum();
        if total_weight <= 0.0 {
            let idx = rng.gen_range(0..leaders.len());
            return leaders.keys().nth(idx).cloned().unwrap();
        }

        let target = rng.gen_range(0.0..total_weight);
        let mut cumulative = 0.0;
        for (id, leader) in leaders.iter() {
            cumulative += leader.weight();
            if cumulative >= target {
                return id.clone();
            }
        }
        leaders.keys().next_back().cloned().unwrap()
    }

    /// Apply the rotation-pressure side effect: consecutive wins beyond
    /// the decay threshold erode the leader's score to encourage handoff.
    fn apply_rotation_pressure(&self, leader_id: &str) {
        let mut previous = self.previous_leader.write();
        let mut leaders = self.leaders.write();
        let Some(leader) = leaders.get_mut(leader_id) else {
            *previous = Some(leader_id.to_string());
            return;
        };

        if previous.as_deref() == Some(leader_id) {
            leader.consecutive_slots += 1;
            if leader.consecutive_slots > STREAK_DECAY_THRESHOLD {
                leader.performance_score = (leader.performance_score * 0.95).max(PERFORMANCE_MIN);
            }
        } else {
            leader.consecutive_slots = 1;
        }
        *previous = Some(leader_id.to_string());
    }

    /// Called on the slot-cadence timer. Creates, leader-assigns, and
    /// announces a new slot.
    pub fn create_new_slot(&self) -> Slot {
        let mut current = self.current_slot_number.write();
        *current += 1;
        let slot_number = *current;
        drop(current);

        let leader_id = self.select_leader(slot_number);
        self.apply_rotation_pressure(&leader_id);

        if let Some(leader) = self.leaders.write().get_mut(&leader_id) {
            leader.last_leader_slot = Some(slot_number);
        }

        let latest = self.pulse.latest();
        let slot = Slot {
            slot_number,
            start_counter: latest.counter,
            end_counter: None,
            is_leader: leader_id == self.self_node_id,
            leader_id,
            start_time: now_secs(),
            end_time: None,
            confirmations: HashSet::new(),
            is_finalized: false,
        };
        self.open_slots.write().insert(slot_number, slot.clone());

        for observer in self.observers.read().iter() {
            observer.on_new_slot(&slot);
        }
        slot
    }

    /// Record a confirmation. Returns `true` if it was newly accepted
    /// (unknown slot numbers and duplicate confirmations are ignored
    /// and return `false`). Finalization is attempted on success.
    pub fn confirm_slot(&self, slot_number: SlotNumber, validator_id: &str) -> bool {
        let accepted = {
            let mut slots = self.open_slots.write();
            match slots.get_mut(&slot_number) {
                Some(slot) if !slot.is_finalized => slot.confirmations.insert(validator_id.to_string()),
                _ => false,
            }
        };
        if accepted {
            self.finalize_slot(slot_number);
        }
        accepted
    }

    fn quorum_needed(&self) -> usize {
        let v = self.validators.read().len();
        let ceil_two_thirds = (2 * v + 2) / 3;
        ceil_two_thirds.max(1)
    }

    /// No-op if already finalized. Finalizes once confirmations reach
    /// `max(1, ceil(2V/3))`, adjusting the leader's performance score
    /// by how close the slot's hash output was to the target rate.
    pub fn finalize_slot(&self, slot_number: SlotNumber) -> bool {
        let needed = self.quorum_needed();
        let finalized_slot = {
            let mut slots = self.open_slots.write();
            let Some(slot) = slots.get_mut(&slot_number) else { return false };
            if slot.is_finalized {
                return true;
            }
            if slot.confirmations.len() < needed {
                return false;
            }
            let latest = self.pulse.latest();
            slot.end_counter = Some(latest.counter);
            slot.end_time = Some(now_secs());
            slot.is_finalized = true;
            slot.clone()
        };
        self.open_slots.write().remove(&slot_number);

        let produced = finalized_slot
            .end_counter
            .unwrap_or(finalized_slot.start_counter)
            .saturating_sub(finalized_slot.start_counter);
        let target = self.target_hashes_per_slot.max(1);
        let within_tolerance = (produced as f64 - target as f64).abs() <= 0.2 * target as f64;
        if let Some(leader) = self.leaders.write().get_mut(&finalized_slot.leader_id) {
            leader.performance_score = if within_tolerance {
                (leader.performance_score * 1.05).min(PERFORMANCE_MAX)
            } else {
                (leader.performance_score * 0.95).max(PERFORMANCE_MIN)
            };
        }

        let mut finalized = self.finalized_slots.write();
        if finalized.len() >= FINALIZED_RING_CAPACITY {
            finalized.pop_front();
        }
        finalized.push_back(finalized_slot.clone());
        drop(finalized);

        for observer in self.observers.read().iter() {
            observer.on_slot_finalized(&finalized_slot);
        }
        true
    }

    pub fn latest_finalized(&self) -> Option<Slot> {
        self.finalized_slots.read().back().cloned()
    }

    pub fn current_slot_number(&self) -> SlotNumber {
        *self.current_slot_number.read()
    }

    pub fn is_finalized(&self, slot_number: SlotNumber) -> bool {
        self.finalized_slots.read().iter().any(|s| s.slot_number == slot_number)
    }

    pub fn leader_snapshot(&self, node_id: &str) -> Option<Leader> {
        self.leaders.read().get(node_id).cloned()
    }

    pub fn spawn_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        this.running.store(true, Ordering::SeqCst);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.slot_duration);
            while this.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                this.create_new_slot();
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

    fn fresh() -> SlotConsensus {
        let pulse = Arc::new(PulseGenerator::new(10_000.0));
        SlotConsensus::new("self", pulse, Duration::from_millis(400), 40)
    }

    #[test]
    fn s4_quorum() {
        let sc = fresh();
        for v in ["v1", "v2", "v3", "v4"] {
            sc.register_validator(v);
        }
        sc.open_slots.write().insert(
            1,
            Slot {
                slot_number: 1,
                start_counter: 0,
                end_counter: None,
                leader_id: "self".into(),
                is_leader: true,
                start_time: now_secs(),
                end_time: None,
                confirmations: HashSet::new(),
                is_finalized: false,
            },
        );

        assert!(sc.confirm_slot(1, "v1"));
        assert!(sc.confirm_slot(1, "v2"));
        assert!(!sc.is_finalized(1));

        assert!(!sc.confirm_slot(1, "v1"));
        assert!(!sc.is_finalized(1));

        assert!(sc.confirm_slot(1, "v3"));
        assert!(sc.is_finalized(1));
        let finalized = sc.latest_finalized().unwrap();
        assert_eq!(finalized.confirmations.len(), 3);
    }

    #[test]
    fn s3_leader_selection_determinism() {
        let sc = fresh();
        sc.register_leader("L1", "pk1", "r1", 100.0);
        sc.register_leader("L2", "pk2", "r1", 100.0);

        let picks_slot7: HashSet<String> = (0..50).map(|_| sc.select_leader(7)).collect();
        assert_eq!(picks_slot7.len(), 1);

        let pick8a = sc.select_leader(8);
        let pick8b = sc.select_leader(8);
        assert_eq!(pick8a, pick8b);
    }

    #[test]
    fn leader_stake_proportionality() {
        let sc = fresh();
        sc.register_leader("small", "pk", "r1", 1.0);
        sc.register_leader("big", "pk", "r1", 3.0);

        let trials = 20_000u32;
        let mut big_wins = 0u32;
        for slot in 0..trials as u64 {
            if sc.select_leader(slot) == "big" {
                big_wins += 1;
            }
        }
        let freq = big_wins as f64 / trials as f64;
        assert!(freq > 0.73 && freq < 0.77, "freq={freq}");
    }

    #[test]
    fn rotation_pressure_decays_after_four_wins() {
        let sc = fresh();
        sc.register_leader("only", "pk", "r1", 10.0);
        for _ in 0..5 {
            sc.create_new_slot();
        }
        let leader = sc.leader_snapshot("only").unwrap();
        assert!(leader.performance_score < 1.0);
    }

    #[test]
    fn no_leaders_falls_back_to_self() {
        let sc = fresh();
        assert_eq!(sc.select_leader(1), "self");
    }

    #[test]
    fn confirm_unknown_slot_returns_false() {
        let sc = fresh();
        assert!(!sc.confirm_slot(999, "v1"));
    }
}
