//! Wiring and process lifecycle: constructs every component in
//! dependency order, wires the narrow event-callback interfaces between
//! them, starts background tasks, and drives cooperative shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{NodeConfig, SignerBackend};
use crate::consensus::SlotConsensus;
use crate::env_integrator::EnvIntegrator;
use crate::error::ConfigError;
use crate::heartbeat::HeartbeatProtocol;
use crate::pulse::PulseGenerator;
use crate::region::RegionManager;
use crate::region_sync::RegionSync;
use crate::signer::{Ed25519Signer, Ed25519Verifier, Signer, SimulatedSigner, SimulatedVerifier, Verifier};

/// Construction order: Signer, Pulse Generator, Environmental Data
/// Integrator, Slot Consensus, Heartbeat Protocol, Region Manager,
/// Region Sync. Each component holds `Arc` references to only the
/// collaborators its own event hooks require.
pub struct Supervisor {
    config: NodeConfig,
    pub pulse: Arc<PulseGenerator>,
    pub env: Arc<EnvIntegrator>,
    pub consensus: Arc<SlotConsensus>,
    pub heartbeat: Arc<HeartbeatProtocol>,
    pub regions: Arc<RegionManager>,
    pub region_sync: Arc<RegionSync>,
    running: Arc<AtomicBool>,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(config: NodeConfig) -> Result<Self, ConfigError> {
        let signer: Arc<dyn Signer> = match config.signer {
            SignerBackend::Ed25519 => {
                let path = Ed25519Signer::default_key_path(&config.data_dir);
                Arc::new(Ed25519Signer::load_or_create(config.node_id.clone(), &path)?)
            }
            SignerBackend::Simulated => Arc::new(SimulatedSigner::new(config.node_id.clone())),
        };
        let verifier: Arc<dyn Verifier> = match config.signer {
            SignerBackend::Ed25519 => Arc::new(Ed25519Verifier),
            SignerBackend::Simulated => Arc::new(SimulatedVerifier),
        };

        let pulse = Arc::new(PulseGenerator::new(config.target_hash_rate_hz));

        let env = Arc::new(EnvIntegrator::new(config.node_id.clone(), Arc::clone(&pulse)).with_min_sources(config.env.min_sources));
        for spec in &config.env.sources {
            env.add_source(spec.into());
        }

        let consensus = Arc::new(SlotConsensus::new(
            config.node_id.clone(),
            Arc::clone(&pulse),
            Duration::from_millis(config.slot_duration_ms),
            (config.target_hash_rate_hz * config.slot_duration_ms as f64 / 1000.0) as u64,
        ));

        let heartbeat = Arc::new(HeartbeatProtocol::new(
            config.node_id.clone(),
            config.region.clone(),
            Arc::clone(&signer),
            Arc::clone(&verifier),
            Arc::clone(&consensus),
            Arc::clone(&pulse),
            Duration::from_millis(config.heartbeat_interval_ms),
            Duration::from_secs(config.node_timeout_s),
        ));

        let regions = Arc::new(RegionManager::new());
        regions.create_region(config.region.clone(), config.region.clone());
        regions.register_node(config.node_id.clone(), config.region.clone());

        let (region_sync, _rx) = RegionSync::new(
            config.region.clone(),
            Arc::clone(&regions),
            Arc::clone(&consensus),
            Arc::clone(&pulse),
            Duration::from_secs(config.sync_interval_s),
        );
        let region_sync = Arc::new(region_sync);

        Ok(Self {
            config,
            pulse,
            env,
            consensus,
            heartbeat,
            regions,
            region_sync,
            running: Arc::new(AtomicBool::new(false)),
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Start every component's background task and log one structured
    /// line per component as it comes online.
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().unwrap();

        tasks.push(self.pulse.spawn_loop());
        tracing::info!(node_id = %self.config.node_id, "pulse generator online");

        tasks.push(self.consensus.spawn_loop());
        tracing::info!("slot consensus online");

        let (mut heartbeat_rx, send_handle, timeout_handle) = self.heartbeat.spawn_loops();
        tasks.push(send_handle);
        tasks.push(timeout_handle);
        tokio::spawn(async move { while heartbeat_rx.recv().await.is_some() {} });
        tracing::info!("heartbeat protocol online");

        tasks.push(self.regions.spawn_loop());
        tracing::info!("region manager online");

        tasks.push(self.region_sync.spawn_loop());
        tracing::info!("region sync online");

        let env = Arc::clone(&self.env);
        let consensus = Arc::clone(&self.consensus);
        let running = Arc::clone(&self.running);
        let slot_duration = Duration::from_millis(self.config.slot_duration_ms);
        let self_node_id = self.config.node_id.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(slot_duration);
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let consensus = Arc::clone(&consensus);
                let self_node_id = self_node_id.clone();
                env.fuse_and_inject(move || {
                    consensus.latest_finalized().map(|s| s.leader_id == self_node_id).unwrap_or(false)
                })
                .await;
            }
        }));
        tracing::info!("environmental data integrator online");
    }

    /// Stop every component in reverse dependency order, waiting up to
    /// 2 s total for tasks to drain.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.region_sync.stop();
        self.regions.stop();
        self.heartbeat.stop();
        self.consensus.stop();
        self.pulse.stop();

        let handles: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        let _ = tokio::time::timeout(Duration::from_secs(2), futures_join_all(handles)).await;
    }
}

async fn futures_join_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(node_id: &str) -> NodeConfig {
        let dir = std::env::temp_dir().join(format!("pulsecore-sup-{}-{}", node_id, std::process::id()));
        let mut config = NodeConfig::default();
        config.node_id = node_id.to_string();
        config.data_dir = dir;
        config.signer = SignerBackend::Simulated;
        config
    }

    #[tokio::test]
    async fn supervisor_constructs_and_shuts_down() {
        let config = test_config("sup-node");
        let dir = config.data_dir.clone();
        let supervisor = Supervisor::new(config).unwrap();
        supervisor.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        supervisor.shutdown().await;
        let _ = std::fs::remove_dir_all(dir);
    }
}
