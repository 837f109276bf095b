//! Sync configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration file name looked up next to the database.
pub const CONFIG_FILE_NAME: &str = "casesync.toml";

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },

    #[error("Invalid base URL {url}: {message}")]
    InvalidBaseUrl { url: String, message: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Settings for delivery, connectivity monitoring and scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Aggregation endpoint, e.g. `http://host:8000`.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-report delivery timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Reachability changes shorter than this are ignored.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Reachability probe interval in seconds (0 disables polling).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Periodic sync interval in seconds (0 disables the timer).
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_request_timeout() -> u64 {
    20
}

fn default_debounce_ms() -> u64 {
    2_000
}

fn default_poll_interval() -> u64 {
    30
}

fn default_sync_interval() -> u64 {
    300
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
            debounce_ms: default_debounce_ms(),
            poll_interval_secs: default_poll_interval(),
            sync_interval_secs: default_sync_interval(),
        }
    }
}

impl SyncConfig {
    /// Loads configuration: defaults, then `path` if it exists, then
    /// `CASESYNC_*` environment variables. The result is validated.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path)?;
                toml::from_str(&content)?
            }
            _ => Self::default(),
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: SyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Supported variables:
    /// - `CASESYNC_BASE_URL`
    /// - `CASESYNC_REQUEST_TIMEOUT_SECS`
    /// - `CASESYNC_DEBOUNCE_MS`
    /// - `CASESYNC_POLL_INTERVAL_SECS`
    /// - `CASESYNC_SYNC_INTERVAL_SECS`
    fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        if let Ok(val) = std::env::var("CASESYNC_BASE_URL") {
            self.base_url = val;
        }
        if let Some(val) = env_u64("CASESYNC_REQUEST_TIMEOUT_SECS", "request_timeout_secs")? {
            self.request_timeout_secs = val;
        }
        if let Some(val) = env_u64("CASESYNC_DEBOUNCE_MS", "debounce_ms")? {
            self.debounce_ms = val;
        }
        if let Some(val) = env_u64("CASESYNC_POLL_INTERVAL_SECS", "poll_interval_secs")? {
            self.poll_interval_secs = val;
        }
        if let Some(val) = env_u64("CASESYNC_SYNC_INTERVAL_SECS", "sync_interval_secs")? {
            self.sync_interval_secs = val;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !(1..=120).contains(&self.request_timeout_secs) {
            return Err(ConfigError::InvalidValue {
                key: "request_timeout_secs",
                message: format!("{} is outside 1..=120", self.request_timeout_secs),
            });
        }
        if self.debounce_ms > 60_000 {
            return Err(ConfigError::InvalidValue {
                key: "debounce_ms",
                message: format!("{} exceeds one minute", self.debounce_ms),
            });
        }

        let url = url::Url::parse(&self.base_url).map_err(|e| ConfigError::InvalidBaseUrl {
            url: self.base_url.clone(),
            message: e.to_string(),
        })?;
        if url.scheme() != "http" {
            return Err(ConfigError::InvalidBaseUrl {
                url: self.base_url.clone(),
                message: format!("unsupported scheme {}", url.scheme()),
            });
        }
        if url.host_str().is_none() {
            return Err(ConfigError::InvalidBaseUrl {
                url: self.base_url.clone(),
                message: "missing host".to_string(),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_secs > 0).then(|| Duration::from_secs(self.poll_interval_secs))
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        (self.sync_interval_secs > 0).then(|| Duration::from_secs(self.sync_interval_secs))
    }
}

fn env_u64(var: &str, key: &'static str) -> ConfigResult<Option<u64>> {
    match std::env::var(var) {
        Ok(val) => val
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key,
                message: format!("{} must be a non-negative integer", var),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.request_timeout(), Duration::from_secs(20));
        assert_eq!(config.poll_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = SyncConfig::from_toml_str(
            r#"
            base_url = "http://10.0.0.5:8000/api"
            sync_interval_secs = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.base_url, "http://10.0.0.5:8000/api");
        assert_eq!(config.sync_interval(), None);
        assert_eq!(config.request_timeout_secs, 20);
    }

    #[test]
    fn test_timeout_bounds() {
        let result = SyncConfig::from_toml_str("request_timeout_secs = 0");
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue {
                key: "request_timeout_secs",
                ..
            })
        ));
        assert!(SyncConfig::from_toml_str("request_timeout_secs = 500").is_err());
    }

    #[test]
    fn test_rejects_https_and_garbage_urls() {
        assert!(matches!(
            SyncConfig::from_toml_str(r#"base_url = "https://example.org""#),
            Err(ConfigError::InvalidBaseUrl { .. })
        ));
        assert!(matches!(
            SyncConfig::from_toml_str(r#"base_url = "not a url""#),
            Err(ConfigError::InvalidBaseUrl { .. })
        ));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            SyncConfig::from_toml_str("base_url = "),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::load(Some(&dir.path().join(CONFIG_FILE_NAME))).unwrap();
        assert_eq!(config.debounce(), Duration::from_millis(2_000));
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "debounce_ms = 500\npoll_interval_secs = 0\n").unwrap();

        let config = SyncConfig::load(Some(&path)).unwrap();
        assert_eq!(config.debounce(), Duration::from_millis(500));
        assert_eq!(config.poll_interval(), None);
    }
}
