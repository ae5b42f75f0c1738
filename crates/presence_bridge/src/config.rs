//! Runtime configuration for the bridge.
//!
//! Loading from disk is left to the embedding binary; this module only
//! defines the settings, their defaults and validation.

use crate::error::BridgeError;
use crate::keys::DEFAULT_PREFIX;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_hostname() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_cache_expire_seconds() -> u64 {
    600
}

fn default_cache_update_interval_seconds() -> u64 {
    10
}

fn default_identity_lease_seconds() -> u64 {
    600
}

fn default_identity_renew_seconds() -> u64 {
    300
}

fn default_reconnect_delay_ms() -> u64 {
    3000
}

fn default_reconnect_budget() -> u32 {
    20
}

fn default_subscription_idle_seconds() -> u64 {
    30
}

/// Where the shared store lives and how to authenticate against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Bound applied to every connect, read and write.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            port: default_port(),
            username: None,
            password: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// How the client should authenticate, derived from [`StoreSettings`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    None,
    Password(String),
    UserPassword { username: String, password: String },
}

impl StoreSettings {
    /// Empty strings count as absent, matching how blank config entries are written.
    pub fn credentials(&self) -> Result<Credentials, BridgeError> {
        let username = self.username.as_deref().filter(|u| !u.is_empty());
        let password = self.password.as_deref().filter(|p| !p.is_empty());
        match (username, password) {
            (Some(username), Some(password)) => Ok(Credentials::UserPassword {
                username: username.to_string(),
                password: password.to_string(),
            }),
            (None, Some(password)) => Ok(Credentials::Password(password.to_string())),
            (None, None) => Ok(Credentials::None),
            (Some(username), None) => Err(BridgeError::Configuration(format!(
                "store username '{}' is set without a password",
                username
            ))),
        }
    }

    /// `timeout_ms` as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Everything the bridge runtime needs to join the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Namespace shared by every front end of one cluster.
    #[serde(default = "default_prefix")]
    pub key_prefix: String,
    #[serde(default)]
    pub store: StoreSettings,
    /// TTL of presence records and rosters.
    #[serde(default = "default_cache_expire_seconds")]
    pub cache_expire_seconds: u64,
    /// Cadence of full refetch, view rebuild and roster publishing.
    #[serde(default = "default_cache_update_interval_seconds")]
    pub cache_update_interval_seconds: u64,
    #[serde(default = "default_identity_lease_seconds")]
    pub identity_lease_seconds: u64,
    #[serde(default = "default_identity_renew_seconds")]
    pub identity_renew_seconds: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Consecutive failed subscribe attempts tolerated before giving up.
    #[serde(default = "default_reconnect_budget")]
    pub reconnect_budget: u32,
    /// Silence on the subscription before a keepalive is sent. A second
    /// silent period drops the connection.
    #[serde(default = "default_subscription_idle_seconds")]
    pub subscription_idle_seconds: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_prefix(),
            store: StoreSettings::default(),
            cache_expire_seconds: default_cache_expire_seconds(),
            cache_update_interval_seconds: default_cache_update_interval_seconds(),
            identity_lease_seconds: default_identity_lease_seconds(),
            identity_renew_seconds: default_identity_renew_seconds(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            reconnect_budget: default_reconnect_budget(),
            subscription_idle_seconds: default_subscription_idle_seconds(),
        }
    }
}

impl BridgeConfig {
    /// Checks every setting before anything touches the store.
    ///
    /// # Returns
    ///
    /// `Err(BridgeError::Configuration)` naming the first offending setting.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.key_prefix.is_empty() {
            return Err(BridgeError::Configuration("key prefix cannot be empty".to_string()));
        }
        if self.store.hostname.is_empty() {
            return Err(BridgeError::Configuration("store hostname cannot be empty".to_string()));
        }
        self.store.credentials()?;
        if self.store.timeout_ms == 0 {
            return Err(BridgeError::Configuration(
                "store timeout_ms must be positive".to_string(),
            ));
        }

        if self.cache_expire_seconds < 2 {
            return Err(BridgeError::Configuration(
                "cache_expire_seconds must be at least 2".to_string(),
            ));
        }
        if self.cache_update_interval_seconds == 0 {
            return Err(BridgeError::Configuration(
                "cache_update_interval_seconds must be positive".to_string(),
            ));
        }
        if self.identity_renew_seconds == 0
            || self.identity_renew_seconds >= self.identity_lease_seconds
        {
            return Err(BridgeError::Configuration(format!(
                "identity_renew_seconds ({}) must be positive and below identity_lease_seconds ({})",
                self.identity_renew_seconds, self.identity_lease_seconds
            )));
        }
        if self.reconnect_budget == 0 {
            return Err(BridgeError::Configuration(
                "reconnect_budget must allow at least one attempt".to_string(),
            ));
        }
        if self.subscription_idle_seconds == 0 {
            return Err(BridgeError::Configuration(
                "subscription_idle_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// TTL written on presence records and roster hashes.
    pub fn cache_expiry(&self) -> Duration {
        Duration::from_secs(self.cache_expire_seconds)
    }

    /// Records are refreshed twice per TTL window.
    pub fn lease_refresh_period(&self) -> Duration {
        Duration::from_secs((self.cache_expire_seconds / 2).max(1))
    }

    pub fn cache_update_interval(&self) -> Duration {
        Duration::from_secs(self.cache_update_interval_seconds)
    }

    /// TTL of the instance id lease key.
    pub fn identity_lease(&self) -> Duration {
        Duration::from_secs(self.identity_lease_seconds)
    }

    pub fn identity_renew(&self) -> Duration {
        Duration::from_secs(self.identity_renew_seconds)
    }

    /// Pause between failed subscribe attempts.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Silence on the subscription before a keepalive is sent, and again
    /// before the connection is given up.
    pub fn subscription_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.subscription_idle_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.key_prefix, "velocity-redis-bridge");
        assert_eq!(config.lease_refresh_period(), Duration::from_secs(300));
    }

    #[test]
    fn test_credential_combinations() {
        let mut store = StoreSettings::default();
        assert_eq!(store.credentials().unwrap(), Credentials::None);

        store.password = Some("secret".to_string());
        assert_eq!(store.credentials().unwrap(), Credentials::Password("secret".to_string()));

        store.username = Some("proxy".to_string());
        assert_eq!(
            store.credentials().unwrap(),
            Credentials::UserPassword {
                username: "proxy".to_string(),
                password: "secret".to_string()
            }
        );

        store.password = Some(String::new());
        assert!(matches!(store.credentials(), Err(BridgeError::Configuration(_))));
    }

    #[test]
    fn test_validation_rejects_bad_timings() {
        let mut config = BridgeConfig::default();
        config.identity_renew_seconds = config.identity_lease_seconds;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.cache_update_interval_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.key_prefix.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_budgets_and_timeouts() {
        let mut config = BridgeConfig::default();
        config.reconnect_budget = 0;
        assert!(matches!(config.validate(), Err(BridgeError::Configuration(m)) if m.contains("reconnect_budget")));

        let mut config = BridgeConfig::default();
        config.store.timeout_ms = 0;
        assert!(matches!(config.validate(), Err(BridgeError::Configuration(m)) if m.contains("timeout_ms")));

        let mut config = BridgeConfig::default();
        config.subscription_idle_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.reconnect_budget = 1;
        assert!(config.validate().is_ok());
    }
}
