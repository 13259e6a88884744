//! Configuration parsing and management.
//!
//! This module handles parsing of the TOML configuration file shared by the
//! bot process and the API daemon. Process-wide policy that operators change
//! at runtime (bonus amounts, access-gate mode) lives in the settings table,
//! not here; see [`crate::settings`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::amount::Credits;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct VexaConfig {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// External HTTP API configuration.
    #[serde(default)]
    pub api: ApiConfig,

    /// Session scratch-store configuration.
    #[serde(default)]
    pub session: SessionConfig,

    /// Billing configuration.
    #[serde(default)]
    pub billing: BillingConfig,
}

impl VexaConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.api.call_cost.is_negative() {
            return Err(ConfigError::Validation(
                "api.call_cost must not be negative".to_string(),
            ));
        }
        if self.api.credential_header.trim().is_empty() {
            return Err(ConfigError::Validation(
                "api.credential_header must not be empty".to_string(),
            ));
        }
        if self.session.scratch_max_entries == 0 {
            return Err(ConfigError::Validation(
                "session.scratch_max_entries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Path to the `SQLite` database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// How long `SQLite` waits on a locked database before reporting busy.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// How many times a write that lost a lock race is retried.
    #[serde(default = "default_contention_retries")]
    pub contention_retries: u32,
}

impl DatabaseConfig {
    /// Returns the busy timeout as a [`Duration`].
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            contention_retries: default_contention_retries(),
        }
    }
}

/// External HTTP API configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiConfig {
    /// Address the API server binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Request header carrying the per-account credential.
    #[serde(default = "default_credential_header")]
    pub credential_header: String,

    /// Credits charged for every authenticated call.
    #[serde(default = "default_call_cost")]
    pub call_cost: Credits,

    /// Request header carrying the administrative secret.
    #[serde(default = "default_admin_header")]
    pub admin_header: String,

    /// Environment variable holding the administrative secret.
    ///
    /// The secret itself is never stored in the configuration file.
    #[serde(default = "default_admin_secret_env")]
    pub admin_secret_env: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            credential_header: default_credential_header(),
            call_cost: default_call_cost(),
            admin_header: default_admin_header(),
            admin_secret_env: default_admin_secret_env(),
        }
    }
}

/// Session scratch-store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    /// Seconds a mid-flow payload stays available.
    #[serde(default = "default_scratch_ttl_secs")]
    pub scratch_ttl_secs: u64,

    /// Hard cap on the number of accounts holding scratch payloads.
    #[serde(default = "default_scratch_max_entries")]
    pub scratch_max_entries: usize,
}

impl SessionConfig {
    /// Returns the scratch TTL as a [`Duration`].
    #[must_use]
    pub const fn scratch_ttl(&self) -> Duration {
        Duration::from_secs(self.scratch_ttl_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scratch_ttl_secs: default_scratch_ttl_secs(),
            scratch_max_entries: default_scratch_max_entries(),
        }
    }
}

/// Billing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BillingConfig {
    /// Upper bound on a single provider call before it is abandoned and the
    /// charge refunded.
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
}

impl BillingConfig {
    /// Returns the provider timeout as a [`Duration`].
    #[must_use]
    pub const fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            provider_timeout_secs: default_provider_timeout_secs(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("vexa.db")
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}

const fn default_contention_retries() -> u32 {
    3
}

fn default_listen_addr() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_credential_header() -> String {
    "X-API-Key".to_string()
}

const fn default_call_cost() -> Credits {
    Credits::whole(1)
}

fn default_admin_header() -> String {
    "X-Admin-API-Key".to_string()
}

fn default_admin_secret_env() -> String {
    "ADMIN_API_KEY".to_string()
}

const fn default_scratch_ttl_secs() -> u64 {
    600
}

const fn default_scratch_max_entries() -> usize {
    10_000
}

const fn default_provider_timeout_secs() -> u64 {
    120
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading config file.
    #[error("failed to read config file: {0}")]
    Io(#[source] std::io::Error),

    /// TOML parse error.
    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize config: {0}")]
    Serialize(#[source] toml::ser::Error),

    /// Validation error.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = VexaConfig::from_toml("").unwrap();
        assert_eq!(config, VexaConfig::default());
        assert_eq!(config.database.path, PathBuf::from("vexa.db"));
        assert_eq!(config.api.credential_header, "X-API-Key");
        assert_eq!(config.api.call_cost, Credits::whole(1));
        assert_eq!(config.session.scratch_ttl(), Duration::from_secs(600));
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [database]
            path = "/var/lib/vexa/bot.db"
            busy_timeout_ms = 250
            contention_retries = 5

            [api]
            listen_addr = "0.0.0.0:9000"
            credential_header = "X-Vexa-Key"
            call_cost = "2.5"

            [session]
            scratch_ttl_secs = 30

            [billing]
            provider_timeout_secs = 45
        "#;

        let config = VexaConfig::from_toml(toml).unwrap();
        assert_eq!(config.database.path, PathBuf::from("/var/lib/vexa/bot.db"));
        assert_eq!(config.database.busy_timeout(), Duration::from_millis(250));
        assert_eq!(config.database.contention_retries, 5);
        assert_eq!(config.api.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.api.credential_header, "X-Vexa-Key");
        assert_eq!(config.api.call_cost, Credits::from_minor(250));
        assert_eq!(config.api.admin_secret_env, "ADMIN_API_KEY");
        assert_eq!(config.session.scratch_ttl_secs, 30);
        assert_eq!(config.session.scratch_max_entries, 10_000);
        assert_eq!(config.billing.provider_timeout(), Duration::from_secs(45));
    }

    #[test]
    fn test_rejects_negative_call_cost() {
        let err = VexaConfig::from_toml("[api]\ncall_cost = \"-1\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_rejects_zero_scratch_capacity() {
        let err = VexaConfig::from_toml("[session]\nscratch_max_entries = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_toml_round_trip_preserves_values() {
        let mut config = VexaConfig::default();
        config.api.call_cost = Credits::from_minor(75);
        let text = config.to_toml().unwrap();
        assert_eq!(VexaConfig::from_toml(&text).unwrap(), config);
    }
}
