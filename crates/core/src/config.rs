use crate::error::{AdPodError, AdPodResult};
use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `ADPOD__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub engine: AdPodEngineConfig,
    #[serde(default)]
    pub defaults: AdPodDefaultsConfig,
}

/// Tuning knobs for slot planning and pod assembly.
#[derive(Debug, Clone, Deserialize)]
pub struct AdPodEngineConfig {
    /// Slot durations are snapped to multiples of this value.
    #[serde(default = "default_smoothing_factor")]
    pub smoothing_factor: i64,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Wall-clock budget for collecting per-sequence search results.
    #[serde(default = "default_assembly_timeout_ms")]
    pub assembly_timeout_ms: u64,
}

/// Values applied to an ad pod extension when the request leaves them out.
#[derive(Debug, Clone, Deserialize)]
pub struct AdPodDefaultsConfig {
    #[serde(default = "default_min_ads")]
    pub min_ads: i64,
    #[serde(default = "default_max_ads")]
    pub max_ads: i64,
    #[serde(default = "default_exclusion_percent")]
    pub exclusion_percent: i64,
}

// Default functions
fn default_node_id() -> String {
    "adpod-01".to_string()
}
fn default_smoothing_factor() -> i64 {
    5
}
fn default_worker_count() -> usize {
    3
}
fn default_assembly_timeout_ms() -> u64 {
    10
}
fn default_min_ads() -> i64 {
    2
}
fn default_max_ads() -> i64 {
    3
}
fn default_exclusion_percent() -> i64 {
    100
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            engine: AdPodEngineConfig::default(),
            defaults: AdPodDefaultsConfig::default(),
        }
    }
}

impl Default for AdPodEngineConfig {
    fn default() -> Self {
        Self {
            smoothing_factor: default_smoothing_factor(),
            worker_count: default_worker_count(),
            assembly_timeout_ms: default_assembly_timeout_ms(),
        }
    }
}

impl Default for AdPodDefaultsConfig {
    fn default() -> Self {
        Self {
            min_ads: default_min_ads(),
            max_ads: default_max_ads(),
            exclusion_percent: default_exclusion_percent(),
        }
    }
}

impl AdPodEngineConfig {
    pub fn validate(&self) -> AdPodResult<()> {
        if self.smoothing_factor <= 0 {
            return Err(AdPodError::Config(format!(
                "engine.smoothing_factor must be positive, got {}",
                self.smoothing_factor
            )));
        }
        if self.worker_count == 0 {
            return Err(AdPodError::Config(
                "engine.worker_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("ADPOD")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
