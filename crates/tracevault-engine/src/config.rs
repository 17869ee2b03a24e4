//! Engine configuration, loaded from TOML.
//!
//! Every section carries `#[serde(default)]`, so an empty file (or no file at
//! all) yields a working configuration.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracevault_core::model::Tier;

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub compressor: CompressorConfig,
    pub pipeline: PipelineConfig,
    pub providers: ProviderConfig,
    pub verification: VerificationConfig,
    pub repair: RepairConfig,
    pub lifecycle: LifecycleConfig,
    pub optimizer: OptimizerConfig,
    pub access: AccessConfig,
    pub cost: CostConfig,
    pub adaptive: AdaptiveConfig,
}

impl EngineConfig {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.compressor;
        if c.flush_threshold == 0 {
            return Err(ConfigError::Invalid("compressor.flush_threshold must be > 0".into()));
        }
        if c.retain_tail >= c.capacity {
            return Err(ConfigError::Invalid(format!(
                "compressor.retain_tail ({}) must be below capacity ({})",
                c.retain_tail, c.capacity
            )));
        }
        if self.providers.failover_threshold == 0 || self.providers.max_store_attempts == 0 {
            return Err(ConfigError::Invalid(
                "providers.failover_threshold and max_store_attempts must be > 0".into(),
            ));
        }
        if self.verification.workers == 0 {
            return Err(ConfigError::Invalid("verification.workers must be > 0".into()));
        }
        if self.optimizer.warm_threshold >= self.optimizer.hot_threshold {
            return Err(ConfigError::Invalid(
                "optimizer.warm_threshold must be below hot_threshold".into(),
            ));
        }
        if self.access.cache_capacity == 0 {
            return Err(ConfigError::Invalid("access.cache_capacity must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.access.prefetch_threshold) {
            return Err(ConfigError::Invalid(
                "access.prefetch_threshold must be within [0, 1]".into(),
            ));
        }
        if self.adaptive.window < 2 {
            return Err(ConfigError::Invalid("adaptive.window must be >= 2".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressorConfig {
    /// Maximum number of records held uncompressed.
    pub capacity: usize,
    /// Records added since the last flush that trigger a compression pass.
    pub flush_threshold: usize,
    /// Most recent records kept uncompressed by a regular pass.
    pub retain_tail: usize,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            flush_threshold: 100,
            retain_tail: 100,
        }
    }
}

/// Optional batch codec stages. Keys are 32 bytes, hex encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub deflate_level: u32,
    pub encryption_key: Option<String>,
    pub hmac_key: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            deflate_level: 6,
            encryption_key: None,
            hmac_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub failover_threshold: u32,
    pub max_store_attempts: usize,
    /// Extra copies written to replica-capable providers on every placement.
    pub replication_factor: usize,
    /// Local fjall-backed providers opened by the daemon.
    pub local: Vec<LocalProviderConfig>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            failover_threshold: 3,
            max_store_attempts: 3,
            replication_factor: 1,
            local: vec![
                LocalProviderConfig::uniform("local-a", [0.10, 0.05, 0.02, 0.01]),
                LocalProviderConfig::uniform("local-b", [0.12, 0.06, 0.025, 0.012]),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalProviderConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub replica: bool,
    /// Cost per GB per day, keyed by tier name.
    pub costs: BTreeMap<Tier, f64>,
}

impl LocalProviderConfig {
    fn uniform(name: &str, costs: [f64; 4]) -> Self {
        Self {
            name: name.to_string(),
            replica: true,
            costs: Tier::ALL.into_iter().zip(costs).collect(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub workers: usize,
    pub interval_secs: u64,
    /// Bounded history of verification outcomes kept for diagnostics.
    pub history_capacity: usize,
}

impl VerificationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            interval_secs: 3600,
            history_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    pub interval_secs: u64,
    pub ledger_capacity: usize,
}

impl RepairConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            interval_secs: 900,
            ledger_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub interval_secs: u64,
}

impl LifecycleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self { interval_secs: 3600 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub interval_secs: u64,
    /// Access count above which data belongs in the hot tier.
    pub hot_threshold: u64,
    /// Access count above which data belongs in the warm tier.
    pub warm_threshold: u64,
}

impl OptimizerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            hot_threshold: 1000,
            warm_threshold: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    pub log_capacity: usize,
    /// Distinct keys tracked for hotspot ranking.
    pub hotspot_capacity: usize,
    /// Keys cached in memory by the hot-data cache.
    pub cache_capacity: usize,
    /// Hotspots the prefetcher predicts from on each pass.
    pub prefetch_sources: usize,
    /// Transition probability above which a predicted key is prefetched.
    pub prefetch_threshold: f64,
    /// Period of the cache refresh and prefetch pass.
    pub cache_interval_secs: u64,
}

impl AccessConfig {
    pub fn cache_interval(&self) -> Duration {
        Duration::from_secs(self.cache_interval_secs)
    }
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            log_capacity: 100_000,
            hotspot_capacity: 100_000,
            cache_capacity: 1000,
            prefetch_sources: 20,
            prefetch_threshold: 0.3,
            cache_interval_secs: 300,
        }
    }
}

/// Price rates are per GB per day.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    pub buffered_rate: f64,
    pub compressed_rate: f64,
    pub archived_rate: f64,
    pub sample_interval_secs: u64,
    pub anomaly_sigma: f64,
    pub anomaly_warmup: usize,
}

impl CostConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            buffered_rate: 0.10,
            compressed_rate: 0.03,
            archived_rate: 0.01,
            sample_interval_secs: 86_400,
            anomaly_sigma: 3.0,
            anomaly_warmup: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Trailing daily-cost samples considered for the trend.
    pub window: usize,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self { window: 30 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config.compressor.capacity, 1000);
        assert_eq!(config.providers.failover_threshold, 3);
        assert_eq!(config.verification.workers, 4);
        assert_eq!(config.access.log_capacity, 100_000);
        assert_eq!(config.providers.local.len(), 2);
    }

    #[test]
    fn test_partial_sections_override_only_given_fields() {
        let config = EngineConfig::from_toml(
            r#"
            [compressor]
            capacity = 50
            retain_tail = 10

            [[providers.local]]
            name = "disk"
            costs = { hot = 0.2, cold = 0.01 }
            "#,
        )
        .unwrap();
        assert_eq!(config.compressor.capacity, 50);
        assert_eq!(config.compressor.flush_threshold, 100);
        assert_eq!(config.providers.local.len(), 1);
        let disk = &config.providers.local[0];
        assert!(disk.replica);
        assert_eq!(disk.costs.get(&Tier::Cold), Some(&0.01));
    }

    #[test]
    fn test_invalid_retain_tail_is_rejected() {
        let err = EngineConfig::from_toml("[compressor]\ncapacity = 10\nretain_tail = 10\n");
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }
}
