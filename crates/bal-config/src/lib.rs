//! Layered YAML configuration with a stable canonical hash, plus the typed
//! `BalanceEngineConfig` surface recognized by the balance engine.
//!
//! Config YAML stores only tunables — never secrets. Secrets are resolved
//! separately from the environment by [`secrets::resolve_secrets`].

pub mod secrets;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

/// Load + merge YAML files in order, then canonicalize to JSON and hash.
/// Later files override earlier files via deep-merge.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut sources = Vec::with_capacity(paths.len());
    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        sources.push(s);
    }
    let refs: Vec<&str> = sources.iter().map(String::as_str).collect();
    load_layered_yaml_from_strings(&refs)
}

/// Same as [`load_layered_yaml`] but takes YAML source strings directly.
/// Used by tests and by callers that already have config contents in hand.
pub fn load_layered_yaml_from_strings(sources: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for (i, s) in sources.iter().enumerate() {
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(s).with_context(|| format!("parse yaml layer {i}"))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    // Canonicalize (stable key order) so semantically-identical configs hash
    // identically regardless of source key ordering.
    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Ok(LoadedConfig {
        config_json: serde_json::from_str(&canonical).context("canonical json parse failed")?,
        canonical_json: canonical,
        config_hash: hash,
    })
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

impl LoadedConfig {
    /// Deserialize the merged, canonicalized config into the typed engine
    /// config surface. Missing sections fall back to their documented
    /// defaults via `#[serde(default)]`.
    pub fn engine_config(&self) -> Result<BalanceEngineConfig> {
        serde_json::from_value(self.config_json.clone())
            .context("config does not match BalanceEngineConfig shape")
    }
}

/// Deep-merge: objects merge recursively; arrays replaced; scalars overwritten.
fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

/// Canonicalize JSON by sorting all object keys recursively and emitting compact JSON.
fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

// ---------------------------------------------------------------------------
// Typed engine config ("Configuration surface")
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceEngineConfig {
    pub batch: BatchConfig,
    pub lease: LeaseConfig,
    pub retry: RetryConfig,
    pub snapshot: SnapshotConfig,
    pub db_pool: DbPoolConfig,
}

impl Default for BalanceEngineConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            lease: LeaseConfig::default(),
            retry: RetryConfig::default(),
            snapshot: SnapshotConfig::default(),
            db_pool: DbPoolConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BatchConfig {
    pub max_records: u32,
    pub max_latency_ms: u64,
    pub long_poll_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_records: 200,
            max_latency_ms: 100,
            long_poll_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LeaseConfig {
    pub ttl_ms: u64,
    pub renew_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 5000,
            renew_ms: 2000,
        }
    }
}

impl LeaseConfig {
    /// Renewal interval must be well under TTL; typical ratio >= 2.5.
    pub fn renewal_ratio_ok(&self) -> bool {
        self.renew_ms > 0 && (self.ttl_ms as f64 / self.renew_ms as f64) >= 2.5
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_interval_ms: u64,
    pub backoff: f64,
    pub dlq_topic: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval_ms: 1000,
            backoff: 2.0,
            dlq_topic: "balance-changes-dlq".to_string(),
        }
    }
}

impl RetryConfig {
    /// Exponential backoff delay before the `attempt`-th retry (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let ms = self.initial_interval_ms as f64 * self.backoff.powi(attempt as i32);
        std::time::Duration::from_millis(ms.round() as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SnapshotConfig {
    pub worker_count: u32,
    pub flush_interval_ms: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            flush_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DbPoolConfig {
    pub max_conns: u32,
    pub queue_limit: u32,
    pub connect_timeout_ms: u64,
}

impl Default for DbPoolConfig {
    fn default() -> Self {
        Self {
            max_conns: 15,
            queue_limit: 256,
            connect_timeout_ms: 5000,
        }
    }
}
