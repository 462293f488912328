//! Environmental data integrator: pulls heterogeneous samples from
//! configured sources, fuses them into a per-slot payload, and hands the
//! payload to the pulse generator just before the leader's next link.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::EnvError;
use crate::pulse::PulseGenerator;

const MAX_DATA_AGE_SECS: f64 = 300.0;
const DEFAULT_MAX_ERRORS: u32 = 5;
const DEFAULT_MIN_SOURCES: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Time,
    Market,
    Weather,
    Custom,
    Network,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub kind: SourceKind,
    pub enabled: bool,
    pub update_interval: Duration,
    pub url: Option<String>,
    pub bearer_token: Option<String>,
}

struct SourceState {
    config: SourceConfig,
    cached: Option<serde_json::Value>,
    confidence: f64,
    collected_at: Instant,
    error_count: u32,
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// One accepted sample ready for fusion.
struct Sample {
    kind: SourceKind,
    confidence: f64,
    payload: serde_json::Value,
}

pub struct EnvIntegrator {
    node_id: String,
    sources: RwLock<HashMap<String, SourceState>>,
    pulse: Arc<PulseGenerator>,
    http: reqwest::Client,
    min_sources: usize,
    max_errors: u32,
    observers: RwLock<Vec<Arc<dyn crate::callbacks::EnvObserver>>>,
}

impl EnvIntegrator {
    pub fn new(node_id: impl Into<String>, pulse: Arc<PulseGenerator>) -> Self {
        Self {
            node_id: node_id.into(),
            sources: RwLock::new(HashMap::new()),
            pulse,
            http: reqwest::Client::new(),
            min_sources: DEFAULT_MIN_SOURCES,
            max_errors: DEFAULT_MAX_ERRORS,
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn with_min_sources(mut self, min_sources: usize) -> Self {
        self.min_sources = min_sources.max(1);
        self
    }

    pub fn subscribe(&self, observer: Arc<dyn crate::callbacks::EnvObserver>) {
        self.observers.write().push(observer);
    }

    /// Register a source. A source with `enabled: false` is stored but
    /// never polled until re-registered with `enabled: true` — it never
    /// defaults to active regardless of where it appears in config.
    pub fn add_source(&self, config: SourceConfig) {
        let source_id = config.source_id.clone();
        self.sources.write().insert(
            source_id,
            SourceState {
                config,
                cached: None,
                confidence: 1.0,
                collected_at: Instant::now() - Duration::from_secs(3600),
                error_count: 0,
            },
        );
    }

    pub fn remove_source(&self, source_id: &str) {
        self.sources.write().remove(source_id);
    }

    fn synth_time() -> serde_json::Value {
        serde_json::json!({
            "timestamp": now_secs(),
            "system_time": now_secs(),
            "ntp_offset": 0.0,
        })
    }

    fn synth_network() -> serde_json::Value {
        serde_json::json!({
            "timestamp": now_secs(),
            "latency_ms": 20.0,
            "packet_loss": 0.0,
            "bandwidth_mbps": 1000.0,
        })
    }

    fn synth_system() -> serde_json::Value {
        serde_json::json!({
            "timestamp": now_secs(),
            "cpu_percent": 0.0,
            "memory_percent": 0.0,
            "disk_percent": 0.0,
            "uptime_secs": 0.0,
            "temperature_c": 0.0,
        })
    }

    async fn poll_http(&self, config: &SourceConfig) -> Result<serde_json::Value, EnvError> {
        let Some(url) = &config.url else {
            return Err(EnvError::SourceError(config.source_id.clone(), "missing url".into()));
        };
        let mut request = self.http.get(url);
        if let Some(token) = &config.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| EnvError::Http { source_id: config.source_id.clone(), detail: e.to_string() })?;
        let mut body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EnvError::Http { source_id: config.source_id.clone(), detail: e.to_string() })?;
        if let serde_json::Value::Object(ref mut map) = body {
            map.entry("timestamp").or_insert(serde_json::json!(now_secs()));
        }
        Ok(body)
    }

    /// Poll one source, honoring its `update_interval` and applying the
    /// cache-decay / error-decay confidence rules on a skipped or failed
    /// poll.
    async fn poll_one(&self, source_id: &str) -> Option<(SourceKind, f64, serde_json::Value)> {
        let (config, due, cached, error_count) = {
            let sources = self.sources.read();
            let state = sources.get(source_id)?;
            if !state.config.enabled {
                return None;
            }
            (
                state.config.clone(),
                state.collected_at.elapsed() >= state.config.update_interval,
                state.cached.clone(),
                state.error_count,
            )
        };

        if !due {
            let age = self.sources.read().get(source_id)?.collected_at.elapsed().as_secs_f64();
            if age >= MAX_DATA_AGE_SECS {
                return None;
            }
            let confidence = (1.0 - age / MAX_DATA_AGE_SECS).max(0.5);
            return cached.map(|payload| (config.kind, confidence, payload));
        }

        let fresh = match config.kind {
            SourceKind::Time => Ok(Self::synth_time()),
            SourceKind::Network => Ok(Self::synth_network()),
            SourceKind::System => Ok(Self::synth_system()),
            SourceKind::Market | SourceKind::Weather | SourceKind::Custom => self.poll_http(&config).await,
        };

        let mut sources = self.sources.write();
        let Some(state) = sources.get_mut(source_id) else { return None };
        match fresh {
            Ok(payload) => {
                state.cached = Some(payload.clone());
                state.confidence = 1.0;
                state.collected_at = Instant::now();
                state.error_count = 0;
                Some((config.kind, 1.0, payload))
            }
            Err(e) => {
                tracing::warn!(source = %source_id, error = %e, "env source poll failed");
                state.error_count += 1;
                if state.error_count > self.max_errors {
                    let confidence = (1.0 - state.error_count as f64 / 10.0).max(0.1);
                    state.confidence = confidence;
                    state.cached.clone().map(|payload| (config.kind, confidence, payload))
                } else {
                    let confidence = (1.0 - error_count as f64 / 10.0).max(0.1);
                    state.cached.clone().map(|payload| (config.kind, confidence, payload))
                }
            }
        }
    }

    async fn collect(&self) -> Vec<Sample> {
        let source_ids: Vec<String> = self.sources.read().keys().cloned().collect();
        let mut samples = Vec::new();
        for id in source_ids {
            if let Some((kind, confidence, payload)) = self.poll_one(&id).await {
                samples.push(Sample { kind, confidence, payload });
            }
        }
        samples
    }

    fn median(values: &mut [f64]) -> f64 {
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let n = values.len();
        if n % 2 == 0 {
            (values[n / 2 - 1] + values[n / 2]) / 2.0
        } else {
            values[n / 2]
        }
    }

    /// Confidence-weighted mean across `(value, confidence)` pairs. When
    /// four or more values are present, values further than 3·MAD from
    /// the median are discarded first.
    fn fuse_numeric_field(mut values: Vec<(f64, f64)>) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        if values.len() >= 4 {
            let mut raw: Vec<f64> = values.iter().map(|(v, _)| *v).collect();
            let median = Self::median(&mut raw);
            let mut deviations: Vec<f64> = raw.iter().map(|v| (v - median).abs()).collect();
            let mad = Self::median(&mut deviations);
            if mad > 0.0 {
                values.retain(|(v, _)| (v - median).abs() <= 3.0 * mad);
            }
        }
        if values.is_empty() {
            return None;
        }
        let total_weight: f64 = values.iter().map(|(_, c)| c).sum();
        if total_weight <= 0.0 {
            return Some(values.iter().map(|(v, _)| v).sum::<f64>() / values.len() as f64);
        }
        Some(values.iter().map(|(v, c)| v * c).sum::<f64>() / total_weight)
    }

    /// Fuse a group of same-kind samples into one JSON object: numeric
    /// fields via confidence-weighted mean (MAD-filtered at n≥4),
    /// non-numeric fields taken from the highest-confidence sample.
    fn fuse_group(samples: &[&Sample]) -> serde_json::Value {
        let mut field_names = std::collections::BTreeSet::new();
        for sample in samples {
            if let serde_json::Value::Object(map) = &sample.payload {
                field_names.extend(map.keys().cloned());
            }
        }

        let best = samples.iter().max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap()).unwrap();

        let mut out = serde_json::Map::new();
        for field in field_names {
            let numeric: Vec<(f64, f64)> = samples
                .iter()
                .filter_map(|s| match s.payload.get(&field) {
                    Some(serde_json::Value::Number(n)) => n.as_f64().map(|v| (v, s.confidence)),
                    _ => None,
                })
                .collect();

            if !numeric.is_empty() {
                if let Some(fused) = Self::fuse_numeric_field(numeric) {
                    out.insert(field, serde_json::json!(fused));
                    continue;
                }
            }
            if let Some(value) = best.payload.get(&field) {
                out.insert(field, value.clone());
            }
        }
        serde_json::Value::Object(out)
    }

    /// Run one fusion pass: collect, age-filter, group, fuse, and
    /// produce the final payload (including its own hash). Returns
    /// `None` (no injection, per §ambient failure semantics) when fewer
    /// than `min_sources` samples survive.
    pub async fn fuse(&self) -> Result<serde_json::Value, EnvError> {
        let samples = self.collect().await;
        if samples.len() < self.min_sources {
            return Err(EnvError::InsufficientSources { have: samples.len(), need: self.min_sources });
        }

        let mut groups: HashMap<String, Vec<&Sample>> = HashMap::new();
        for sample in &samples {
            let key = serde_json::to_string(&sample.kind).unwrap_or_default();
            groups.entry(key).or_default().push(sample);
        }

        let mut payload = serde_json::Map::new();
        payload.insert("timestamp".into(), serde_json::json!(now_secs()));
        payload.insert("source_count".into(), serde_json::json!(samples.len()));
        payload.insert("integrated_by".into(), serde_json::json!(self.node_id));
        for (kind, group) in &groups {
            payload.insert(kind.clone(), Self::fuse_group(group));
        }

        let without_hash = serde_json::Value::Object(payload.clone());
        let digest = crate::pulse::canonical_json(&without_hash);
        let hash = {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(digest.as_bytes());
            hex::encode(hasher.finalize())
        };
        payload.insert("hash".into(), serde_json::json!(hash));
        Ok(serde_json::Value::Object(payload))
    }

    /// Run fusion — collection happens unconditionally, on every
    /// caller's tick, regardless of leadership — and inject the result
    /// only if `is_leader` (evaluated *after* fusion completes, the
    /// narrowest possible window) still holds. Fusion failure, or a
    /// leadership change discovered at this final check, both leave the
    /// pulse's existing env-hash untouched; the chain still advances.
    pub async fn fuse_and_inject(&self, is_leader: impl FnOnce() -> bool) {
        match self.fuse().await {
            Ok(payload) => {
                if !is_leader() {
                    return;
                }
                self.pulse.next(Some(&payload));
                for observer in self.observers.read().iter() {
                    observer.on_data_collected(&payload);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "env fusion produced no injection this slot");
            }
        }
    }
}
