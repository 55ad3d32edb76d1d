//! Hub configuration
//!
//! Loads listener and queue settings from a TOML file. Every key is optional;
//! a missing file yields the defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::hub::DEFAULT_QUEUE_CAPACITY;

/// Default configuration file name
pub const CONFIG_FILE: &str = "fanout-hub.toml";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Hub configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HubConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// HTTP path accepted for the websocket upgrade
    pub path: String,
    /// Capacity of the fan-in queue
    pub queue_capacity: usize,
    /// Capacity of each peer's outbound queue
    pub peer_buffer: usize,
    /// Upper bound on a single socket write, in milliseconds (0 disables)
    pub write_timeout_ms: u64,
    /// Accepted `Origin` header values; empty accepts any origin
    pub allowed_origins: Vec<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8000,
            path: "/ws".to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            peer_buffer: 256,
            write_timeout_ms: 10_000,
            allowed_origins: Vec::new(),
        }
    }
}

impl HubConfig {
    /// Load configuration from a file, falling back to defaults if it is absent
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: HubConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check the values are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "path must start with '/': {}",
                self.path
            )));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be non-zero".into()));
        }
        if self.peer_buffer == 0 {
            return Err(ConfigError::Invalid("peer_buffer must be non-zero".into()));
        }
        Ok(())
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Per-write timeout, if enabled
    pub fn write_timeout(&self) -> Option<Duration> {
        (self.write_timeout_ms > 0).then(|| Duration::from_millis(self.write_timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.socket_addr(), "0.0.0.0:8000");
        assert_eq!(config.path, "/ws");
        assert!(config.allowed_origins.is_empty());
        assert_eq!(config.write_timeout(), Some(Duration::from_secs(10)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_nonexistent_returns_default() {
        let dir = tempdir().unwrap();
        let config = HubConfig::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config, HubConfig::default());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(
            &path,
            r#"
port = 9100
path = "/hub"
allowed_origins = ["https://example.com"]
"#,
        )
        .unwrap();

        let config = HubConfig::load(&path).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.path, "/hub");
        assert_eq!(config.allowed_origins, vec!["https://example.com".to_string()]);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        let config = HubConfig {
            bind: "127.0.0.1".to_string(),
            write_timeout_ms: 0,
            ..HubConfig::default()
        };
        config.save(&path).unwrap();

        let loaded = HubConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.write_timeout(), None);
    }

    #[test]
    fn test_parse_invalid_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "port = [[[").unwrap();

        assert!(matches!(HubConfig::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = HubConfig {
            path: "ws".to_string(),
            ..HubConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = HubConfig {
            queue_capacity: 0,
            ..HubConfig::default()
        };
        assert!(config.validate().is_err());

        let config = HubConfig {
            peer_buffer: 0,
            ..HubConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
