//! Engine configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Tunables of a [`RuleService`](crate::RuleService).
///
/// Every field has a default, so a YAML file only needs the fields it
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleServiceConfig {
    /// Directory holding the state file, parsed rules and compiled indexes
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// State file name, relative to `data_dir`
    #[serde(default = "default_state_file")]
    pub state_file: String,

    /// Refresh interval for lists without an `Expires` header
    #[serde(default = "default_refresh_interval_secs")]
    pub default_refresh_interval_secs: u64,

    #[serde(default = "default_min_refresh_interval_secs")]
    pub min_refresh_interval_secs: u64,

    #[serde(default = "default_max_refresh_interval_secs")]
    pub max_refresh_interval_secs: u64,

    /// Delay before retrying a failed fetch
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,

    /// Debounce delay for state file writes
    #[serde(default = "default_persist_delay_secs")]
    pub persist_delay_secs: u64,

    /// Minimum spacing of blocked-URL notifications
    #[serde(default = "default_notification_interval_ms")]
    pub notification_interval_ms: u64,

    /// Consecutive compiled-index load failures before a group gives up
    #[serde(default = "default_max_index_load_failures")]
    pub max_index_load_failures: u32,

    /// Request decisions cached per group; zero disables the cache
    #[serde(default = "default_decision_cache_capacity")]
    pub decision_cache_capacity: usize,

    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./k2filter-data")
}
fn default_state_file() -> String {
    "rule_service.json".to_string()
}
fn default_refresh_interval_secs() -> u64 {
    7 * 24 * 3600
}
fn default_min_refresh_interval_secs() -> u64 {
    24 * 3600
}
fn default_max_refresh_interval_secs() -> u64 {
    14 * 24 * 3600
}
fn default_retry_backoff_secs() -> u64 {
    3600
}
fn default_persist_delay_secs() -> u64 {
    10
}
fn default_notification_interval_ms() -> u64 {
    1000
}
fn default_max_index_load_failures() -> u32 {
    3
}
fn default_decision_cache_capacity() -> usize {
    10_000
}
fn default_fetch_timeout_secs() -> u64 {
    30
}

impl Default for RuleServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            state_file: default_state_file(),
            default_refresh_interval_secs: default_refresh_interval_secs(),
            min_refresh_interval_secs: default_min_refresh_interval_secs(),
            max_refresh_interval_secs: default_max_refresh_interval_secs(),
            retry_backoff_secs: default_retry_backoff_secs(),
            persist_delay_secs: default_persist_delay_secs(),
            notification_interval_ms: default_notification_interval_ms(),
            max_index_load_failures: default_max_index_load_failures(),
            decision_cache_capacity: default_decision_cache_capacity(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

impl RuleServiceConfig {
    /// Default configuration rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: RuleServiceConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_refresh_interval_secs > self.max_refresh_interval_secs {
            return Err(crate::Error::Config(format!(
                "min_refresh_interval_secs ({}) exceeds max_refresh_interval_secs ({})",
                self.min_refresh_interval_secs, self.max_refresh_interval_secs
            )));
        }
        if self.state_file.is_empty() {
            return Err(crate::Error::Config("state_file is empty".to_string()));
        }
        Ok(())
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(&self.state_file)
    }

    pub fn default_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.default_refresh_interval_secs)
    }

    /// Refresh interval for a list, honouring its `Expires` header within bounds.
    pub fn refresh_interval(&self, expires: Option<Duration>) -> Duration {
        match expires {
            Some(expires) => expires
                .max(Duration::from_secs(self.min_refresh_interval_secs))
                .min(Duration::from_secs(self.max_refresh_interval_secs)),
            None => self.default_refresh_interval(),
        }
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn persist_delay(&self) -> Duration {
        Duration::from_secs(self.persist_delay_secs)
    }

    pub fn notification_interval(&self) -> Duration {
        Duration::from_millis(self.notification_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuleServiceConfig::default();
        assert_eq!(config.persist_delay(), Duration::from_secs(10));
        assert_eq!(config.notification_interval(), Duration::from_secs(1));
        assert_eq!(config.max_index_load_failures, 3);
        assert_eq!(config.state_path(), PathBuf::from("./k2filter-data/rule_service.json"));
    }

    #[test]
    fn test_partial_yaml() {
        let config = RuleServiceConfig::from_yaml(
            "data_dir: /var/lib/k2filter\npersist_delay_secs: 2\n",
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/k2filter"));
        assert_eq!(config.persist_delay_secs, 2);
        assert_eq!(config.retry_backoff_secs, 3600);
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        let err = RuleServiceConfig::from_yaml(
            "min_refresh_interval_secs: 100\nmax_refresh_interval_secs: 10\n",
        );
        assert!(matches!(err, Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_refresh_interval_clamped() {
        let config = RuleServiceConfig::default();
        let hour = Duration::from_secs(3600);
        assert_eq!(config.refresh_interval(Some(hour)), Duration::from_secs(24 * 3600));
        assert_eq!(
            config.refresh_interval(Some(Duration::from_secs(4 * 86_400))),
            Duration::from_secs(4 * 86_400)
        );
        assert_eq!(
            config.refresh_interval(Some(Duration::from_secs(90 * 86_400))),
            Duration::from_secs(14 * 86_400)
        );
        assert_eq!(config.refresh_interval(None), config.default_refresh_interval());
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k2filter.yaml");
        std::fs::write(&path, "decision_cache_capacity: 0\n").unwrap();
        let config = RuleServiceConfig::load(&path).unwrap();
        assert_eq!(config.decision_cache_capacity, 0);
    }
}
