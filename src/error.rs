use thiserror::Error;

/// Errors produced by the pulse generator.
#[derive(Debug, Error)]
pub enum PulseError {
    #[error("chain ring is empty and genesis synthesis failed")]
    EmptyChain,

    #[error("import batch rejected: link at offset {offset} failed verification")]
    VerifyFailure { offset: usize },

    #[error("export range out of bounds: start={start} count={count} len={len}")]
    RangeOutOfBounds { start: u64, count: u64, len: usize },
}

/// Errors produced by slot consensus.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("unknown slot number {0}")]
    UnknownSlot(u64),

    #[error("quorum insufficient: have {have}, need {need}")]
    QuorumInsufficient { have: usize, need: usize },

    #[error("no leaders registered")]
    NoLeaders,
}

/// Errors produced by the heartbeat protocol.
#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("unknown peer {0}")]
    UnknownPeer(String),

    #[error("signature verification failed")]
    VerifyFailure,

    #[error("duplicate sequence {sequence} for node {node_id}")]
    DuplicateSequence { node_id: String, sequence: u64 },

    #[error("clock skew: heartbeat timestamp {timestamp} exceeds now+1s ({bound})")]
    ClockSkew { timestamp: f64, bound: f64 },
}

/// Errors produced by the region manager.
#[derive(Debug, Error)]
pub enum RegionError {
    #[error("unknown region {0}")]
    UnknownRegion(String),

    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("region {0} cannot connect to itself")]
    SelfConnection(String),
}

/// Errors produced by the region sync plane.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("stale message: {age_secs:.1}s old")]
    StaleMessage { age_secs: f64 },

    #[error("target region {0} is not this node's region")]
    WrongTarget(String),

    #[error("source region {0} is not connected")]
    NotConnected(String),

    #[error("duplicate message id {0}")]
    Duplicate(String),

    #[error("region {0} unknown to region sync")]
    UnknownRegion(String),
}

/// Errors produced while collecting or fusing environmental data.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("source {0} poll failed: {1}")]
    SourceError(String, String),

    #[error("not enough accepted samples: have {have}, need {need}")]
    InsufficientSources { have: usize, need: usize },

    #[error("http request to source {source_id} failed: {detail}")]
    Http { source_id: String, detail: String },
}

/// Errors produced by the signer.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("key file at {path} is corrupt or truncated: {detail}")]
    CorruptKeyFile { path: String, detail: String },

    #[error("signature verification failed")]
    VerifyFailure,
}

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config value: {0}")]
    Invalid(String),

    #[error(transparent)]
    Signer(#[from] SignerError),
}

/// Crate-wide error type aggregating every component's error enum.
///
/// Public, boolean-returning operations (`verify`, `confirm_slot`,
/// `process_heartbeat`, sync acceptance) keep their `bool` signature per
/// the wire contract; this type exists for paths where callers want the
/// diagnostic detail, and for `ConfigError`, which always propagates.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Pulse(#[from] PulseError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Heartbeat(#[from] HeartbeatError),

    #[error(transparent)]
    Region(#[from] RegionError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Env(#[from] EnvError),

    #[error(transparent)]
    Signer(#[from] SignerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
