//! # Configuration
//!
//! TOML configuration for the connection manager, its transports and the registry file.
//! Every section and field has a default, so an empty file (or a file that predates a
//! setting) still loads.
//!
//! ```toml
//! [manager]
//! keepalive_interval_secs = 180
//! handshake_timeout_secs = 45
//!
//! [network]
//! poll_interval_ms = 300
//! accept_invalid_certs = false
//!
//! [serial]
//! baud_rate = 115200
//!
//! [storage]
//! registry_file = "./data/connections.json"
//!
//! [logging]
//! level = "info"
//! file = "meshlink.log"
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Lifecycle timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Period of the keep-alive heartbeat once connected. Older firmware tooling used
    /// five minutes; three is the default here.
    pub keepalive_interval_secs: u64,
    /// Time allowed between transport open and the basic configuration completing.
    pub handshake_timeout_secs: u64,
    /// Re-send period for an unanswered configuration request.
    pub want_config_retry_secs: u64,
    /// Upper bound on closing a link during teardown.
    pub close_timeout_ms: u64,
    /// Upper bound on each passive probe and on the network liveness check.
    pub probe_timeout_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: 180,
            handshake_timeout_secs: 45,
            want_config_retry_secs: 7,
            close_timeout_ms: 2000,
            probe_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
    /// Failed polls in a row before the link counts as lost.
    pub max_consecutive_failures: u32,
    /// Trust self-signed device certificates without the browser step.
    pub accept_invalid_certs: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 300,
            request_timeout_ms: 5000,
            max_consecutive_failures: 3,
            accept_invalid_certs: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Used when a record does not carry its own baud rate.
    pub baud_rate: u32,
    pub reopen_delay_ms: u64,
    pub release_timeout_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115200,
            reopen_delay_ms: 250,
            release_timeout_ms: 2000,
            read_timeout_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub registry_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            registry_file: "./data/connections.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("meshlink.log".to_string()),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Rejects values that would make the manager spin or never time out.
    pub fn validate(&self) -> Result<()> {
        if self.manager.keepalive_interval_secs == 0 {
            return Err(anyhow!("manager.keepalive_interval_secs must be greater than 0"));
        }
        if self.manager.handshake_timeout_secs == 0 {
            return Err(anyhow!("manager.handshake_timeout_secs must be greater than 0"));
        }
        if self.manager.want_config_retry_secs == 0 {
            return Err(anyhow!("manager.want_config_retry_secs must be greater than 0"));
        }
        if self.network.poll_interval_ms == 0 {
            return Err(anyhow!("network.poll_interval_ms must be greater than 0"));
        }
        if self.serial.baud_rate == 0 {
            return Err(anyhow!("serial.baud_rate must be greater than 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.manager.keepalive_interval_secs, 180);
        assert_eq!(config.manager.want_config_retry_secs, 7);
        assert_eq!(config.serial.baud_rate, 115200);
        assert_eq!(config.storage.registry_file, "./data/connections.json");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [manager]
            keepalive_interval_secs = 300
            "#,
        )
        .unwrap();
        assert_eq!(config.manager.keepalive_interval_secs, 300);
        assert_eq!(config.manager.handshake_timeout_secs, 45);
        assert_eq!(config.network.max_consecutive_failures, 3);
    }

    #[test]
    fn zero_keepalive_is_rejected() {
        let mut config = Config::default();
        config.manager.keepalive_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn default_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();
        Config::create_default(path).await.unwrap();
        let loaded = Config::load(path).await.unwrap();
        assert_eq!(loaded.network.poll_interval_ms, 300);
        assert_eq!(loaded.logging.level, "info");
    }
}
