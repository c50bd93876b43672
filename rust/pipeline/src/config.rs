use std::time::Duration;

use backon::ExponentialBuilder;
use serde::{Deserialize, Serialize};
use strata_cache::CacheConfig;
use strata_config::helpers::{deserialize_duration_from_millis, serialize_duration_to_millis};
use strata_config::{load_from_path, ConfigError};
use strata_tracing::TracingConfig;

use crate::errors::PipelineError;
use crate::loader::RelationshipLoadingConfig;

pub const DEFAULT_CONFIG_PATH: &str = "./strata_config.yaml";
pub const ENV_PREFIX: &str = "STRATA_";

fn default_chunk_size() -> usize {
    1000
}

fn default_memory_limit_bytes() -> usize {
    500 * 1024 * 1024
}

fn default_degradation_threshold() -> f64 {
    0.8
}

fn default_min_chunk_size() -> usize {
    100
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_base_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_retry_delay() -> Duration {
    Duration::from_millis(30_000)
}

fn default_max_groups_per_spec() -> usize {
    10_000
}

fn default_fetch_timeout() -> Duration {
    Duration::from_millis(30_000)
}

fn default_cache_timeout() -> Duration {
    Duration::from_millis(1_000)
}

fn default_consumer_timeout() -> Duration {
    Duration::from_millis(30_000)
}

fn default_snapshot_timeout() -> Duration {
    Duration::from_millis(5_000)
}

fn default_max_demand() -> usize {
    4
}

fn default_component_queue_size() -> usize {
    64
}

fn default_max_retained_terminal() -> usize {
    256
}

/// Tuning of every pipeline started by an orchestrator.
/// # Fields
/// - `chunk_size` - records requested per page before any degradation
/// - `memory_limit_bytes` - hard memory ceiling; past it at `min_chunk_size` the pipeline fails
/// - `degradation_threshold` - fraction of the limit above which chunk sizes are halved
/// - `max_retries` - retries of a failing fetch, not counting the first attempt
/// - `max_groups_per_spec` - distinct group keys kept per aggregation level
/// - `max_demand` - chunks a consumer may have requested ahead of reading them
/// - `max_retained_terminal` - ended pipelines an orchestrator keeps for inspection
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PipelineConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_memory_limit_bytes")]
    pub memory_limit_bytes: usize,
    #[serde(default = "default_degradation_threshold")]
    pub degradation_threshold: f64,
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(
        rename = "retry_base_delay_ms",
        default = "default_retry_base_delay",
        deserialize_with = "deserialize_duration_from_millis",
        serialize_with = "serialize_duration_to_millis"
    )]
    pub retry_base_delay: Duration,
    #[serde(
        rename = "max_retry_delay_ms",
        default = "default_max_retry_delay",
        deserialize_with = "deserialize_duration_from_millis",
        serialize_with = "serialize_duration_to_millis"
    )]
    pub max_retry_delay: Duration,
    #[serde(default = "default_max_groups_per_spec")]
    pub max_groups_per_spec: usize,
    #[serde(
        rename = "fetch_timeout_ms",
        default = "default_fetch_timeout",
        deserialize_with = "deserialize_duration_from_millis",
        serialize_with = "serialize_duration_to_millis"
    )]
    pub fetch_timeout: Duration,
    #[serde(
        rename = "cache_timeout_ms",
        default = "default_cache_timeout",
        deserialize_with = "deserialize_duration_from_millis",
        serialize_with = "serialize_duration_to_millis"
    )]
    pub cache_timeout: Duration,
    #[serde(
        rename = "consumer_timeout_ms",
        default = "default_consumer_timeout",
        deserialize_with = "deserialize_duration_from_millis",
        serialize_with = "serialize_duration_to_millis"
    )]
    pub consumer_timeout: Duration,
    #[serde(
        rename = "snapshot_timeout_ms",
        default = "default_snapshot_timeout",
        deserialize_with = "deserialize_duration_from_millis",
        serialize_with = "serialize_duration_to_millis"
    )]
    pub snapshot_timeout: Duration,
    #[serde(default = "default_max_demand")]
    pub max_demand: usize,
    #[serde(default = "default_component_queue_size")]
    pub component_queue_size: usize,
    #[serde(default = "default_max_retained_terminal")]
    pub max_retained_terminal: usize,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub relationship_loading: RelationshipLoadingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            chunk_size: default_chunk_size(),
            memory_limit_bytes: default_memory_limit_bytes(),
            degradation_threshold: default_degradation_threshold(),
            min_chunk_size: default_min_chunk_size(),
            max_retries: default_max_retries(),
            retry_base_delay: default_retry_base_delay(),
            max_retry_delay: default_max_retry_delay(),
            max_groups_per_spec: default_max_groups_per_spec(),
            fetch_timeout: default_fetch_timeout(),
            cache_timeout: default_cache_timeout(),
            consumer_timeout: default_consumer_timeout(),
            snapshot_timeout: default_snapshot_timeout(),
            max_demand: default_max_demand(),
            component_queue_size: default_component_queue_size(),
            max_retained_terminal: default_max_retained_terminal(),
            cache: CacheConfig::default(),
            relationship_loading: RelationshipLoadingConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |reason: String| Err(PipelineError::InvalidConfig(reason));
        if self.chunk_size == 0 || self.min_chunk_size == 0 {
            return invalid("chunk sizes must be positive".to_string());
        }
        if self.min_chunk_size > self.chunk_size {
            return invalid(format!(
                "min_chunk_size {} exceeds chunk_size {}",
                self.min_chunk_size, self.chunk_size
            ));
        }
        if !(self.degradation_threshold > 0.0 && self.degradation_threshold <= 1.0) {
            return invalid(format!(
                "degradation_threshold {} is outside (0, 1]",
                self.degradation_threshold
            ));
        }
        if self.memory_limit_bytes == 0 {
            return invalid("memory_limit_bytes must be positive".to_string());
        }
        if self.max_groups_per_spec == 0 {
            return invalid("max_groups_per_spec must be positive".to_string());
        }
        if self.max_demand == 0 || self.component_queue_size == 0 {
            return invalid("max_demand and component_queue_size must be positive".to_string());
        }
        if self.retry_base_delay > self.max_retry_delay {
            return invalid(format!(
                "retry_base_delay {:?} exceeds max_retry_delay {:?}",
                self.retry_base_delay, self.max_retry_delay
            ));
        }
        if self.fetch_timeout.is_zero()
            || self.cache_timeout.is_zero()
            || self.consumer_timeout.is_zero()
            || self.snapshot_timeout.is_zero()
        {
            return invalid("timeouts must be positive".to_string());
        }
        Ok(())
    }

    /// Memory usage above which chunk sizes are halved.
    pub fn degradation_bytes(&self) -> usize {
        (self.memory_limit_bytes as f64 * self.degradation_threshold) as usize
    }
}

/// Backoff between fetch retries: `retry_base_delay * 2^n`, capped at
/// `max_retry_delay`. Jitter is off so delays strictly increase until the cap.
impl From<&PipelineConfig> for ExponentialBuilder {
    fn from(config: &PipelineConfig) -> Self {
        ExponentialBuilder::default()
            .with_factor(2.0)
            .with_min_delay(config.retry_base_delay)
            .with_max_delay(config.max_retry_delay)
            .with_max_times(config.max_retries)
    }
}

/// Root of the service's configuration file.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PipelineServiceConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
}

impl PipelineServiceConfig {
    /// Loads `./strata_config.yaml`, overridden by `STRATA_` environment
    /// variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from_path(path: &str) -> Result<Self, ConfigError> {
        let config: Self = load_from_path(path, ENV_PREFIX)?;
        config
            .pipeline
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.degradation_bytes(), 400 * 1024 * 1024);
    }

    #[test]
    fn durations_are_read_in_millis() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"fetch_timeout_ms": 250, "chunk_size": 500}"#)
                .expect("valid config");
        assert_eq!(config.fetch_timeout, Duration::from_millis(250));
        assert_eq!(config.chunk_size, 500);
        assert_eq!(config.min_chunk_size, 100);
    }

    #[test]
    fn nonsensical_values_are_rejected() {
        let bad = [
            PipelineConfig {
                chunk_size: 0,
                ..Default::default()
            },
            PipelineConfig {
                min_chunk_size: 2_000,
                ..Default::default()
            },
            PipelineConfig {
                degradation_threshold: 1.5,
                ..Default::default()
            },
            PipelineConfig {
                degradation_threshold: 0.0,
                ..Default::default()
            },
            PipelineConfig {
                max_demand: 0,
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(matches!(
                config.validate(),
                Err(PipelineError::InvalidConfig(_))
            ));
        }
    }
}
