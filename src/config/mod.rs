//! Configuration
//!
//! TOML-based configuration with support for:
//! - Logging level
//! - Default per-principal quota
//! - Static authentication (user table with permission filter lists)
//! - Environment variable overrides (DRIFTMQ_* prefix)
//! - `${VAR}` and `${VAR:-default}` substitution inside the config file

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::auth::Quota;
use crate::topic::validate_topic_filter;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Default per-principal quota
    pub quota: QuotaConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Per-principal quota configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Seconds a disconnected persistent session is retained
    #[serde(default = "default_max_idle_session_ttl")]
    pub max_idle_session_ttl: u64,
    /// Largest accepted message payload in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Packet identifiers available for concurrent in-flight messages
    #[serde(default = "default_max_packet_identifiers")]
    pub max_packet_identifiers: u16,
    /// QoS 0 output queue depth
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size_qos0: usize,
    /// QoS 1 output queue depth
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size_qos1: usize,
    /// QoS 2 output queue depth
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size_qos2: usize,
}

fn default_max_idle_session_ttl() -> u64 {
    60
}
fn default_max_packet_size() -> usize {
    65535
}
fn default_max_packet_identifiers() -> u16 {
    10
}
fn default_max_queue_size() -> usize {
    100
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_idle_session_ttl: default_max_idle_session_ttl(),
            max_packet_size: default_max_packet_size(),
            max_packet_identifiers: default_max_packet_identifiers(),
            max_queue_size_qos0: default_max_queue_size(),
            max_queue_size_qos1: default_max_queue_size(),
            max_queue_size_qos2: default_max_queue_size(),
        }
    }
}

impl QuotaConfig {
    pub fn to_quota(&self) -> Quota {
        Quota {
            max_idle_session_ttl: Duration::from_secs(self.max_idle_session_ttl),
            max_packet_size: self.max_packet_size,
            max_packet_identifiers: self.max_packet_identifiers,
            max_queue_size_qos0: self.max_queue_size_qos0,
            max_queue_size_qos1: self.max_queue_size_qos1,
            max_queue_size_qos2: self.max_queue_size_qos2,
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Allow connections without credentials
    pub allow_anonymous: bool,
    /// Permissions granted to every principal, anonymous included
    pub default_permissions: PermissionsConfig,
    /// Static user table
    pub users: Vec<UserConfig>,
}

/// Permission filter lists
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PermissionsConfig {
    pub publish: Vec<String>,
    pub subscribe: Vec<String>,
    pub retain: Vec<String>,
}

/// A single user entry
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub username: String,
    /// Plaintext password; omit to accept any password for this user
    pub password: Option<String>,
    /// Permissions granted in addition to the defaults
    #[serde(default)]
    pub permissions: PermissionsConfig,
    /// Quota override for this user
    pub quota: Option<QuotaConfig>,
}

impl Config {
    /// Load configuration from a TOML file with environment variable
    /// substitution and `DRIFTMQ_*` overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);

        let settings = config::Config::builder()
            .add_source(File::from_str(&content, FileFormat::Toml))
            .add_source(Environment::with_prefix("DRIFTMQ").separator("__"))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for inconsistencies
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.log.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "unknown log level: {}",
                    other
                )))
            }
        }

        if self.quota.max_packet_identifiers == 0 {
            return Err(ConfigError::Validation(
                "quota.max_packet_identifiers must be at least 1".to_string(),
            ));
        }

        let check_filters = |owner: &str, filters: &[String]| -> Result<(), ConfigError> {
            for filter in filters {
                validate_topic_filter(filter).map_err(|e| {
                    ConfigError::Validation(format!("{}: filter {:?}: {}", owner, filter, e))
                })?;
            }
            Ok(())
        };

        check_filters("default_permissions", &self.auth.default_permissions.publish)?;
        check_filters("default_permissions", &self.auth.default_permissions.subscribe)?;
        check_filters("default_permissions", &self.auth.default_permissions.retain)?;
        for user in &self.auth.users {
            if user.username.is_empty() {
                return Err(ConfigError::Validation(
                    "auth.users entries must have a username".to_string(),
                ));
            }
            check_filters(&user.username, &user.permissions.publish)?;
            check_filters(&user.username, &user.permissions.subscribe)?;
            check_filters(&user.username, &user.permissions.retain)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.log.level, "info");
        assert_eq!(config.quota.max_packet_identifiers, 10);
        assert!(!config.auth.allow_anonymous);
        assert!(config.auth.users.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [log]
            level = "debug"

            [quota]
            max_packet_identifiers = 32
            max_queue_size_qos0 = 10

            [auth]
            allow_anonymous = true

            [auth.default_permissions]
            subscribe = ["public/#"]

            [[auth.users]]
            username = "sensor"
            password = "secret"

            [auth.users.permissions]
            publish = ["sensors/+/data"]
            retain = ["sensors/+/data"]
            "#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.quota.max_packet_identifiers, 32);
        assert_eq!(config.quota.max_queue_size_qos0, 10);
        assert!(config.auth.allow_anonymous);
        assert_eq!(config.auth.users.len(), 1);
        assert_eq!(config.auth.users[0].username, "sensor");
        assert_eq!(
            config.auth.users[0].permissions.publish,
            vec!["sensors/+/data"]
        );
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("DRIFTMQ_TEST_LEVEL", "warn");
        let substituted = substitute_env_vars("level = \"${DRIFTMQ_TEST_LEVEL}\"");
        assert_eq!(substituted, "level = \"warn\"");

        let substituted = substitute_env_vars("level = \"${DRIFTMQ_UNSET_VAR:-error}\"");
        assert_eq!(substituted, "level = \"error\"");
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let config = Config {
            log: LogConfig {
                level: "loud".to_string(),
            },
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_invalid_permission_filter_rejected() {
        let mut config = Config::default();
        config.auth.default_permissions.publish = vec!["a/#/b".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation(_))
        ));
    }
}
