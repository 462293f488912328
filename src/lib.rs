pub mod callbacks;
pub mod config;
pub mod consensus;
pub mod env_integrator;
pub mod error;
pub mod heartbeat;
pub mod pulse;
pub mod region;
pub mod region_sync;
pub mod signer;
pub mod supervisor;

pub use callbacks::{ConsensusObserver, EnvObserver, HeartbeatObserver, NullObserver, RegionObserver};
pub use config::NodeConfig;
pub use consensus::{Leader, Slot, SlotConsensus, SlotNumber};
pub use env_integrator::{EnvIntegrator, SourceConfig, SourceKind};
pub use error::CoreError;
pub use heartbeat::{Heartbeat, HeartbeatProtocol, NodeStatus};
pub use pulse::{PulseGenerator, PulseHash};
pub use region::{CoordinatorId, NodeDescriptor, RegionInfo, RegionManager};
pub use region_sync::{RegionSync, SyncMessage, SyncMessageType};
pub use signer::{Ed25519Signer, Ed25519Verifier, Signer, SimulatedSigner, SimulatedVerifier, Verifier};
pub use supervisor::Supervisor;
