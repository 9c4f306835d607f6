//! Discovery configuration
//!
//! Values come from an optional YAML file and are then overridden by CLI
//! flags or environment variables (see [`crate::cli::DiscoveryArgs`]).

use crate::{KubedoxError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_DOMAIN_SUFFIX: &str = "cluster.local";
pub const DEFAULT_SPEC_PATH: &str = "swagger.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    /// Informer relist period in seconds; 0 disables periodic relists
    pub resync_period_secs: u64,
    pub domain_suffix: String,
    /// Hostnames to ignore; an entry also matches hostnames starting with it
    pub ignored_services: Vec<String>,
    pub probe_timeout_ms: u64,
    /// Path probed on every candidate location
    pub spec_path: String,
    /// Prefix of the keys in the discovered specs map
    pub spec_dir: String,
    /// Delay before a failed queue task is retried
    pub error_delay_ms: u64,
    pub queue_qps: f64,
    pub queue_burst: u32,
    /// Give up on a task after this many retries; `None` retries forever
    pub max_task_retries: Option<u32>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            resync_period_secs: 60,
            domain_suffix: DEFAULT_DOMAIN_SUFFIX.to_string(),
            ignored_services: Vec::new(),
            probe_timeout_ms: 5000,
            spec_path: DEFAULT_SPEC_PATH.to_string(),
            spec_dir: String::new(),
            error_delay_ms: 1000,
            queue_qps: 10.0,
            queue_burst: 100,
            max_task_retries: None,
        }
    }
}

impl DiscoveryConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: DiscoveryConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.queue_qps > 0.0) {
            return Err(KubedoxError::ConfigError(format!(
                "queue_qps must be positive, got {}",
                self.queue_qps
            )));
        }
        if self.queue_burst == 0 {
            return Err(KubedoxError::ConfigError(
                "queue_burst must be at least 1".to_string(),
            ));
        }
        if self.probe_timeout_ms == 0 {
            return Err(KubedoxError::ConfigError(
                "probe_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.spec_path.trim_matches('/').is_empty() {
            return Err(KubedoxError::ConfigError(
                "spec_path must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn resync_period(&self) -> Option<Duration> {
        match self.resync_period_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn error_delay(&self) -> Duration {
        Duration::from_millis(self.error_delay_ms)
    }

    /// True when `hostname` is on the deny-list
    pub fn is_ignored(&self, hostname: &str) -> bool {
        self.ignored_services
            .iter()
            .any(|entry| !entry.is_empty() && hostname.starts_with(entry.as_str()))
    }
}
