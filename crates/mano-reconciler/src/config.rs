//! Reconciler daemon configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use mano_core::logging::LoggingConfig;
use mano_core::{ManoError, Result};

use crate::optimized::OptimizerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Bind address of the health/metrics surface.
    pub listen_addr: String,
    /// Worker tasks draining the workqueue.
    pub workers: usize,
    pub optimizer: OptimizerSettings,
    pub package_repo_url: Option<String>,
    pub deployment_service_url: Option<String>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSettings {
    pub max_concurrent: usize,
    pub enable_semaphore: bool,
    pub enable_cache: bool,
    pub enable_batching: bool,
    pub cache_capacity: usize,
    pub cache_ttl_secs: u64,
    pub batch_flush_interval_secs: u64,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        let defaults = OptimizerConfig::default();
        Self {
            max_concurrent: defaults.max_concurrent,
            enable_semaphore: defaults.enable_semaphore,
            enable_cache: defaults.enable_cache,
            enable_batching: defaults.enable_batching,
            cache_capacity: defaults.cache_capacity,
            cache_ttl_secs: defaults.cache_ttl.as_secs(),
            batch_flush_interval_secs: defaults.batch_flush_interval.as_secs(),
        }
    }
}

impl From<&OptimizerSettings> for OptimizerConfig {
    fn from(settings: &OptimizerSettings) -> Self {
        Self {
            max_concurrent: settings.max_concurrent,
            enable_semaphore: settings.enable_semaphore,
            enable_cache: settings.enable_cache,
            enable_batching: settings.enable_batching,
            cache_capacity: settings.cache_capacity,
            cache_ttl: Duration::from_secs(settings.cache_ttl_secs),
            batch_flush_interval: Duration::from_secs(settings.batch_flush_interval_secs),
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8082".to_string(),
            workers: 4,
            optimizer: OptimizerSettings::default(),
            package_repo_url: None,
            deployment_service_url: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl ReconcilerConfig {
    /// Load from a YAML file. Unknown keys are tolerated; malformed YAML is a
    /// startup error.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ManoError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_yaml::from_str(&raw)
            .map_err(|e| ManoError::Configuration(format!("malformed config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_yaml_and_tolerates_unknown_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "listen_addr: 127.0.0.1:9000\nworkers: 2\nfuture_flag: true\noptimizer:\n  max_concurrent: 4\n"
        )
        .unwrap();
        let config = ReconcilerConfig::load(file.path()).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.workers, 2);
        assert_eq!(config.optimizer.max_concurrent, 4);
        // unspecified settings keep their defaults
        assert!(config.optimizer.enable_cache);
    }

    #[test]
    fn malformed_yaml_is_a_configuration_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "listen_addr: [unclosed").unwrap();
        let err = ReconcilerConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ManoError::Configuration(_)));
    }
}
