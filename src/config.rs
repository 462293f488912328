//! Layered configuration for the supervisor: compiled-in defaults,
//! overridden by an optional TOML file, overridden by a handful of
//! environment variables for the knobs most often tuned per deployment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::env_integrator::{SourceConfig, SourceKind};
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignerBackend {
    Ed25519,
    Simulated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvSourceSpec {
    pub source_id: String,
    pub source_type: SourceKind,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub update_interval_secs: u64,
    pub enabled: bool,
}

impl From<&EnvSourceSpec> for SourceConfig {
    fn from(spec: &EnvSourceSpec) -> Self {
        SourceConfig {
            source_id: spec.source_id.clone(),
            kind: spec.source_type,
            enabled: spec.enabled,
            update_interval: std::time::Duration::from_secs(spec.update_interval_secs.max(1)),
            url: spec.api_url.clone(),
            bearer_token: spec.api_key.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    pub sources: Vec<EnvSourceSpec>,
    pub min_sources: usize,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self { sources: Vec::new(), min_sources: 1 }
    }
}

/// The supervisor's own configuration surface. Every field has a
/// compiled-in default; only `node_id` is mandatory in practice (it
/// defaults to an empty string, which `Supervisor::start` rejects).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub region: String,
    pub data_dir: PathBuf,
    pub signer: SignerBackend,
    pub slot_duration_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub node_timeout_s: u64,
    pub sync_interval_s: u64,
    pub target_hash_rate_hz: f64,
    pub log_level: String,
    pub log_format: LogFormat,
    pub env: EnvConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            region: "default".to_string(),
            data_dir: PathBuf::from(".pulsecore"),
            signer: SignerBackend::Ed25519,
            slot_duration_ms: 400,
            heartbeat_interval_ms: 250,
            node_timeout_s: 10,
            sync_interval_s: 5,
            target_hash_rate_hz: 10_000.0,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            env: EnvConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load defaults, overlay an optional TOML file, then overlay the
    /// operational environment variables most often tuned per
    /// deployment (`PULSECORE_NODE_ID`, `PULSECORE_REGION`,
    /// `PULSECORE_DATA_DIR`, `PULSECORE_LOG_LEVEL`), mirroring the
    /// default-then-file-then-env layering network configuration has
    /// long used for bootstrap peers.
    pub fn load(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let path = config_path
            .map(PathBuf::from)
            .or_else(|| std::env::var("PULSECORE_CONFIG").ok().map(PathBuf::from));

        if let Some(path) = path {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::Read { path: path.display().to_string(), source: e })?;
            config = toml::from_str(&contents)
                .map_err(|e| ConfigError::Parse { path: path.display().to_string(), source: e })?;
        }

        if let Ok(node_id) = std::env::var("PULSECORE_NODE_ID") {
            config.node_id = node_id;
        }
        if let Ok(region) = std::env::var("PULSECORE_REGION") {
            config.region = region;
        }
        if let Ok(data_dir) = std::env::var("PULSECORE_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }
        if let Ok(log_level) = std::env::var("PULSECORE_LOG_LEVEL") {
            config.log_level = log_level;
        }

        if config.node_id.trim().is_empty() {
            return Err(ConfigError::Invalid("node_id must not be empty".to_string()));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_reject_empty_node_id() {
        std::env::remove_var("PULSECORE_CONFIG");
        std::env::remove_var("PULSECORE_NODE_ID");
        assert!(NodeConfig::load(None).is_err());
    }

    #[test]
    fn env_var_overrides_node_id() {
        std::env::set_var("PULSECORE_NODE_ID", "env-node");
        let config = NodeConfig::load(None).unwrap();
        assert_eq!(config.node_id, "env-node");
        std::env::remove_var("PULSECORE_NODE_ID");
    }

    #[test]
    fn toml_file_is_applied_before_env_override() {
        let dir = std::env::temp_dir().join(format!("pulsecore-cfg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("node.toml");
        std::fs::write(&path, "node_id = \"from-file\"\nregion = \"eu\"\n").unwrap();

        std::env::remove_var("PULSECORE_NODE_ID");
        let config = NodeConfig::load(Some(&path)).unwrap();
        assert_eq!(config.node_id, "from-file");
        assert_eq!(config.region, "eu");

        std::env::set_var("PULSECORE_NODE_ID", "from-env");
        let config = NodeConfig::load(Some(&path)).unwrap();
        assert_eq!(config.node_id, "from-env");
        std::env::remove_var("PULSECORE_NODE_ID");
        let _ = std::fs::remove_dir_all(dir);
    }
}
