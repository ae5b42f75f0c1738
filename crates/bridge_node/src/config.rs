//! Configuration file handling for the bridge node.
//!
//! The file has three tables: `[bridge]` for cluster timing and the node's
//! own behaviour, `[store]` for the shared store connection and
//! `[logging]`. Missing keys fall back to defaults so a partial file works.

use anyhow::Context;
use presence_bridge::{BridgeConfig, StoreSettings, DEFAULT_PREFIX};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Contents of the node's TOML file.
///
/// # Examples
///
/// ```toml
/// [bridge]
/// key_prefix = "presence"
/// watch_channels = ["announcements"]
///
/// [store]
/// hostname = "127.0.0.1"
/// port = 6379
///
/// [logging]
/// level = "info"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bridge: BridgeSettings,
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Cluster settings plus what this node does once it has joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    pub key_prefix: String,
    pub cache_expire_seconds: u64,
    pub cache_update_interval_seconds: u64,
    pub identity_lease_seconds: u64,
    pub identity_renew_seconds: u64,
    pub reconnect_delay_ms: u64,
    pub reconnect_budget: u32,
    pub subscription_idle_seconds: u64,
    /// Backends this node publishes (empty) rosters for.
    pub backends: Vec<String>,
    /// Bus channel keys whose traffic is logged.
    pub watch_channels: Vec<String>,
    /// How often cluster statistics are logged, 0 to disable.
    pub monitor_interval_seconds: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        let defaults = BridgeConfig::default();
        Self {
            key_prefix: DEFAULT_PREFIX.to_string(),
            cache_expire_seconds: defaults.cache_expire_seconds,
            cache_update_interval_seconds: defaults.cache_update_interval_seconds,
            identity_lease_seconds: defaults.identity_lease_seconds,
            identity_renew_seconds: defaults.identity_renew_seconds,
            reconnect_delay_ms: defaults.reconnect_delay_ms,
            reconnect_budget: defaults.reconnect_budget,
            subscription_idle_seconds: defaults.subscription_idle_seconds,
            backends: Vec::new(),
            watch_channels: Vec::new(),
            monitor_interval_seconds: 60,
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// trace, debug, info, warn or error
    pub level: String,
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Loads the file, writing a default one first when it does not exist.
    pub async fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let config: AppConfig =
                toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("writing default config to {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// The library configuration carried inside this file.
    pub fn to_bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            key_prefix: self.bridge.key_prefix.clone(),
            store: self.store.clone(),
            cache_expire_seconds: self.bridge.cache_expire_seconds,
            cache_update_interval_seconds: self.bridge.cache_update_interval_seconds,
            identity_lease_seconds: self.bridge.identity_lease_seconds,
            identity_renew_seconds: self.bridge.identity_renew_seconds,
            reconnect_delay_ms: self.bridge.reconnect_delay_ms,
            reconnect_budget: self.bridge.reconnect_budget,
            subscription_idle_seconds: self.bridge.subscription_idle_seconds,
        }
    }

    /// Runs the library's checks, then the node's own.
    pub fn validate(&self) -> Result<(), String> {
        self.to_bridge_config().validate().map_err(|e| e.to_string())?;

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.to_bridge_config(), BridgeConfig::default());
        assert_eq!(config.bridge.monitor_interval_seconds, 60);
    }

    #[tokio::test]
    async fn test_missing_file_is_created_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bridge.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());

        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded, config);
    }

    #[tokio::test]
    async fn test_partial_file_keeps_defaults() {
        let toml_content = r#"
[bridge]
key_prefix = "staging-bridge"
backends = ["lobby", "survival"]

[store]
hostname = "redis.internal"
password = "hunter2"

[logging]
level = "debug"
"#;
        let temp_file = NamedTempFile::new().unwrap();
        tokio::fs::write(temp_file.path(), toml_content).await.unwrap();

        let config = AppConfig::load_from_file(temp_file.path()).await.unwrap();
        assert_eq!(config.bridge.key_prefix, "staging-bridge");
        assert_eq!(config.bridge.backends, vec!["lobby".to_string(), "survival".to_string()]);
        assert_eq!(config.bridge.cache_expire_seconds, 600);
        assert_eq!(config.store.hostname, "redis.internal");
        assert_eq!(config.store.port, StoreSettings::default().port);
        assert_eq!(config.logging.level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = AppConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().unwrap_err().contains("Invalid log level"));

        let mut config = AppConfig::default();
        config.store.username = Some("admin".to_string());
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.bridge.identity_renew_seconds = config.bridge.identity_lease_seconds;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.bridge.reconnect_budget = 0;
        assert!(config.validate().unwrap_err().contains("reconnect_budget"));

        let mut config = AppConfig::default();
        config.store.timeout_ms = 0;
        assert!(config.validate().unwrap_err().contains("timeout_ms"));
    }
}
