//! The pulse generator: a continuous, verifiable hash sequence binding
//! optional external entropy into each link.
//!
//! `next` is the sole writer and is internally serialized; `latest`,
//! `verify`, and `export` are lock-free or read-locked. `verify` takes no
//! generator state at all — every link carries everything needed to
//! recompute its own digest, which is what lets peers validate an
//! imported chain without trusting the sender.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::PulseError;

const CHAIN_RING_CAPACITY: usize = 1000;
const GENESIS_PREV_SEED: &[u8] = b"PulseChain PoH Genesis";
const GENESIS_ENV_SEED: &[u8] = b"Initial Environment Data";

/// One link in the pulse timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseHash {
    pub hash: [u8; 32],
    pub counter: u64,
    pub timestamp: f64,
    pub env_hash: [u8; 32],
    pub prev_hash: [u8; 32],
}

fn sha256_link(prev_hash: &[u8; 32], counter: u64, env_hash: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(counter.to_le_bytes());
    hasher.update(env_hash);
    hasher.finalize().into()
}

fn sha256_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn genesis_prev_hash() -> [u8; 32] {
    sha256_bytes(GENESIS_PREV_SEED)
}

fn genesis_env_hash() -> [u8; 32] {
    sha256_bytes(GENESIS_ENV_SEED)
}

/// Canonicalize an arbitrary JSON value: object keys sorted recursively,
/// so the same logical payload always hashes to the same digest.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut sorted = std::collections::BTreeMap::new();
                for (k, v) in map {
                    sorted.insert(k.clone(), sort(v));
                }
                let ordered: serde_json::Map<String, serde_json::Value> =
                    sorted.into_iter().collect();
                serde_json::Value::Object(ordered)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

impl PulseHash {
    /// The deterministic genesis link, synthesized read-only: calling
    /// this never mutates a generator's ring or counter.
    pub fn genesis() -> Self {
        let prev_hash = genesis_prev_hash();
        let env_hash = genesis_env_hash();
        let hash = sha256_link(&prev_hash, 0, &env_hash);
        Self {
            hash,
            counter: 0,
            timestamp: now_secs(),
            env_hash,
            prev_hash,
        }
    }

    /// Recompute this link's digest from its own declared fields and
    /// compare. The genesis link (counter 0) hashes directly on counter
    /// 0; every later link hashes on `counter - 1`, the counter value
    /// that was current at the moment it was emitted.
    pub fn verify(&self) -> bool {
        let expected = if self.counter == 0 {
            sha256_link(&self.prev_hash, 0, &self.env_hash)
        } else {
            sha256_link(&self.prev_hash, self.counter - 1, &self.env_hash)
        };
        expected == self.hash
    }
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

struct PulseState {
    ring: VecDeque<PulseHash>,
    counter: u64,
    prev_hash: [u8; 32],
    env_hash: [u8; 32],
    last_hash_at: Instant,
    hash_rate_ewma: f64,
}

impl PulseState {
    fn new() -> Self {
        Self {
            ring: VecDeque::with_capacity(CHAIN_RING_CAPACITY),
            counter: 0,
            prev_hash: genesis_prev_hash(),
            env_hash: genesis_env_hash(),
            last_hash_at: Instant::now(),
            hash_rate_ewma: 0.0,
        }
    }
}

/// Target hash rate, in hashes per second, for the background cadence
/// loop. The loop computes a nominal per-hash interval and sleeps the
/// residual after each hash, so observed rate tracks `target_hz` even
/// when an individual hash takes non-trivial wall time.
pub struct PulseGenerator {
    state: RwLock<PulseState>,
    target_hz: f64,
    running: Arc<AtomicBool>,
}

impl PulseGenerator {
    pub fn new(target_hz: f64) -> Self {
        Self {
            state: RwLock::new(PulseState::new()),
            target_hz,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Emit the next link. If `env_data` is provided its canonical-JSON
    /// SHA-256 becomes the sticky `env_hash` for this and all subsequent
    /// links until the next payload arrives.
    pub fn next(&self, env_data: Option<&serde_json::Value>) -> PulseHash {
        let mut state = self.state.write();
        if let Some(data) = env_data {
            state.env_hash = sha256_bytes(canonical_json(data).as_bytes());
        }
        let hash = sha256_link(&state.prev_hash, state.counter, &state.env_hash);
        let link = PulseHash {
            hash,
            counter: state.counter + 1,
            timestamp: now_secs(),
            env_hash: state.env_hash,
            prev_hash: state.prev_hash,
        };

        let elapsed = state.last_hash_at.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            let instantaneous = 1.0 / elapsed;
            state.hash_rate_ewma = if state.hash_rate_ewma == 0.0 {
                instantaneous
            } else {
                0.9 * state.hash_rate_ewma + 0.1 * instantaneous
            };
        }
        state.last_hash_at = Instant::now();

        state.counter = link.counter;
        state.prev_hash = link.hash;
        if state.ring.len() >= CHAIN_RING_CAPACITY {
            state.ring.pop_front();
        }
        state.ring.push_back(link.clone());
        link
    }

    /// The most recent link, or a read-only synthesized genesis if no
    /// link has been emitted yet.
    pub fn latest(&self) -> PulseHash {
        let state = self.state.read();
        state.ring.back().cloned().unwrap_or_else(PulseHash::genesis)
    }

    pub fn hash_rate(&self) -> f64 {
        self.state.read().hash_rate_ewma
    }

    /// Export up to `count` links starting at pulse counter `start`.
    pub fn export(&self, start: u64, count: u64) -> Vec<PulseHash> {
        let state = self.state.read();
        state
            .ring
            .iter()
            .filter(|l| l.counter >= start)
            .take(count as usize)
            .cloned()
            .collect()
    }

    /// Validate and adopt an externally supplied chain segment.
    ///
    /// Every link must pass its own `verify`, and each link's
    /// `prev_hash` must equal its predecessor's `hash` within the batch
    /// (continuity beyond what per-link `verify` alone establishes).
    /// The whole batch is rejected on the first failure.
    pub fn import(&self, chain: &[PulseHash]) -> Result<(), PulseError> {
        for (i, link) in chain.iter().enumerate() {
            if !link.verify() {
                return Err(PulseError::VerifyFailure { offset: i });
            }
            if i > 0 && chain[i - 1].hash != link.prev_hash {
                return Err(PulseError::VerifyFailure { offset: i });
            }
        }
        let Some(last) = chain.last() else { return Ok(()) };

        let mut state = self.state.write();
        for link in chain {
            if state.ring.back().map(|b| b.counter) < Some(link.counter) {
                if state.ring.len() >= CHAIN_RING_CAPACITY {
                    state.ring.pop_front();
                }
                state.ring.push_back(link.clone());
            }
        }
        state.counter = last.counter;
        state.prev_hash = last.hash;
        state.env_hash = last.env_hash;
        Ok(())
    }

    /// Spawn the background cadence task that calls `next()` at
    /// `target_hz`, observing the shared shutdown flag at least once
    /// per hash.
    pub fn spawn_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        this.running.store(true, Ordering::SeqCst);
        let interval = Duration::from_secs_f64((1.0 / this.target_hz).max(0.0));
        tokio::spawn(async move {
            while this.running.load(Ordering::SeqCst) {
                let started = Instant::now();
                this.next(None);
                let elapsed = started.elapsed();
                if elapsed < interval {
                    tokio::time::sleep(interval - elapsed).await;
                }
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
    use serde_json::json;

    #[test]
    fn s1_pulse_linkage() {
        let gen = PulseGenerator::new(10_000.0);
        let genesis = PulseHash::genesis();
        assert_eq!(genesis.prev_hash, genesis_prev_hash());
        assert_eq!(genesis.env_hash, genesis_env_hash());

        let a = gen.next(None);
        let b = gen.next(None);
        let c = gen.next(None);
        assert_eq!((a.counter, b.counter, c.counter), (1, 2, 3));
        assert!(a.verify() && b.verify() && c.verify());
        assert_eq!(a.prev_hash, genesis.hash);
        assert_eq!(b.prev_hash, a.hash);
    }

    #[test]
    fn s2_env_injection_changes_hash() {
        let gen = PulseGenerator::new(10_000.0);
        let a = gen.next(None);
        let b = gen.next(Some(&json!({"k": 1})));
        let c = gen.next(Some(&json!({"k": 2})));

        assert_eq!(a.env_hash, genesis_env_hash());
        assert_eq!(b.env_hash, sha256_bytes(canonical_json(&json!({"k": 1})).as_bytes()));
        assert_ne!(b.env_hash, c.env_hash);
        assert_ne!(a.hash, b.hash);
        assert_ne!(b.hash, c.hash);
    }

    #[test]
    fn pulse_monotonicity() {
        let gen = PulseGenerator::new(10_000.0);
        for i in 1..=50u64 {
            let link = gen.next(None);
            assert_eq!(link.counter, i);
            assert!(link.verify());
        }
    }

    #[test]
    fn pulse_determinism() {
        let a = PulseGenerator::new(10_000.0);
        let b = PulseGenerator::new(10_000.0);
        let injections: Vec<Option<serde_json::Value>> =
            vec![None, Some(json!({"x": 1})), None, Some(json!({"y": "z"}))];
        for inj in &injections {
            let la = a.next(inj.as_ref());
            let lb = b.next(inj.as_ref());
            assert_eq!(la.hash, lb.hash);
            assert_eq!(la.env_hash, lb.env_hash);
        }
    }

    #[test]
    fn import_round_trip_and_corruption_rejected() {
        let gen = PulseGenerator::new(10_000.0);
        for _ in 0..5 {
            gen.next(None);
        }
        let exported = gen.export(0, 10);
        let target = PulseGenerator::new(10_000.0);
        assert!(target.import(&exported).is_ok());
        assert_eq!(target.latest().hash, gen.latest().hash);

        let mut corrupted = exported.clone();
        corrupted[2].hash[0] ^= 0xFF;
        let fresh = PulseGenerator::new(10_000.0);
        assert!(fresh.import(&corrupted).is_err());
    }
}
