//! Configuration management for the devshell client.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/devshell/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

use crate::encoding::TextEncoding;

/// Default remote host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default remote port.
pub const DEFAULT_PORT: u16 = 5555;

/// Service opened when none is configured.
pub const DEFAULT_SERVICE: &str = "shell:";

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("host must not be empty")]
    EmptyHost,

    #[error("port must be between 1 and 65535, got {0}")]
    InvalidPort(u16),

    #[error("connect_timeout_secs must be between 1 and 3600 when set, got {0}")]
    InvalidConnectTimeout(u64),

    #[error("service is not a valid descriptor: {0}")]
    InvalidService(String),

    #[error("key paths must differ, both are {0}")]
    SameKeyPaths(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the devshell client.
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Where to connect.
    pub remote: RemoteConfig,

    /// Key file locations.
    pub identity: IdentityConfig,

    /// What to relay and how.
    pub relay: RelayConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

/// The device daemon to connect to.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteConfig {
    /// Host name or address.
    pub host: String,

    /// TCP port.
    pub port: u16,

    /// Give up on dial plus handshake after this many seconds.
    /// Unset waits indefinitely.
    pub connect_timeout_secs: Option<u64>,
}

/// Where the client's key pair lives.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdentityConfig {
    /// Public key file.
    pub public_key_path: PathBuf,

    /// Private key file.
    pub private_key_path: PathBuf,
}

/// Relay settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Service descriptor of the stream to open.
    pub service: String,

    /// Single-byte text encoding used in both directions.
    pub encoding: TextEncoding,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout_secs: None,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        let dir = default_data_dir();
        Self {
            public_key_path: dir.join("pub.key"),
            private_key_path: dir.join("priv.key"),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            service: DEFAULT_SERVICE.to_string(),
            encoding: TextEncoding::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("devshell")
        .join("config.toml")
}

/// Returns the default directory for key files.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("devshell")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - DEVSHELL_HOST: Override remote host
    /// - DEVSHELL_PORT: Override remote port (ignored if not a number)
    /// - DEVSHELL_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("DEVSHELL_HOST") {
            if !host.is_empty() {
                tracing::info!("Overriding host from environment: {}", host);
                self.remote.host = host;
            }
        }

        if let Ok(port) = std::env::var("DEVSHELL_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Overriding port from environment: {}", port);
                    self.remote.port = port;
                }
                Err(_) if port.is_empty() => {}
                Err(e) => tracing::warn!("Ignoring DEVSHELL_PORT={:?}: {}", port, e),
            }
        }

        if let Ok(level) = std::env::var("DEVSHELL_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.logging.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }

        if self.remote.port == 0 {
            return Err(ConfigError::InvalidPort(self.remote.port));
        }

        if let Some(secs) = self.remote.connect_timeout_secs {
            if secs == 0 || secs > 3600 {
                return Err(ConfigError::InvalidConnectTimeout(secs));
            }
        }

        if let Err(e) = protocol::validate_descriptor(&self.relay.service) {
            return Err(ConfigError::InvalidService(e.to_string()));
        }

        if self.identity.public_key_path == self.identity.private_key_path {
            return Err(ConfigError::SameKeyPaths(
                self.identity.public_key_path.display().to_string(),
            ));
        }

        let level = self.logging.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.log_level.clone()));
        }

        Ok(())
    }

    /// Connect timeout, if one is configured.
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.remote.connect_timeout_secs.map(Duration::from_secs)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from `~/.config/devshell/config.toml`.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.remote.host, "127.0.0.1");
        assert_eq!(config.remote.port, 5555);
        assert_eq!(config.remote.connect_timeout_secs, None);
        assert_eq!(config.relay.service, "shell:");
        assert_eq!(config.relay.encoding, TextEncoding::Ascii);
        assert_eq!(config.logging.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_key_paths() {
        let identity = IdentityConfig::default();
        assert!(identity.public_key_path.ends_with("devshell/pub.key"));
        assert!(identity.private_key_path.ends_with("devshell/priv.key"));
    }

    #[test]
    fn test_from_toml_empty() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[remote]
host = "192.168.1.137"

[relay]
encoding = "latin1"
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.remote.host, "192.168.1.137");
        assert_eq!(config.remote.port, 5555);
        assert_eq!(config.relay.service, "shell:");
        assert_eq!(config.relay.encoding, TextEncoding::Latin1);
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[remote]
host = "device.local"
port = 5037
connect_timeout_secs = 10

[identity]
public_key_path = "/keys/pub.key"
private_key_path = "/keys/priv.key"

[relay]
service = "shell:logcat"
encoding = "ascii"

[logging]
log_level = "debug"
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.remote.port, 5037);
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.identity.private_key_path, PathBuf::from("/keys/priv.key"));
        assert_eq!(config.relay.service, "shell:logcat");
        assert_eq!(config.logging.log_level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_unknown_encoding() {
        let toml = r#"
[relay]
encoding = "utf-8"
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[remote]
port = "five"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[remote\nhost = ").unwrap();

        let err = format!("{:#}", Config::load(&path).unwrap_err());
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_validate_empty_host() {
        let mut config = Config::default();
        config.remote.host = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyHost));
    }

    #[test]
    fn test_validate_port_zero() {
        let mut config = Config::default();
        config.remote.port = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPort(0)));
    }

    #[test]
    fn test_validate_connect_timeout() {
        let mut config = Config::default();
        config.remote.connect_timeout_secs = Some(0);
        assert_eq!(config.validate(), Err(ConfigError::InvalidConnectTimeout(0)));

        config.remote.connect_timeout_secs = Some(3601);
        assert_eq!(config.validate(), Err(ConfigError::InvalidConnectTimeout(3601)));

        config.remote.connect_timeout_secs = Some(5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_service() {
        let mut config = Config::default();
        config.relay.service = "shell:\0".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidService(_))));
    }

    #[test]
    fn test_validate_same_key_paths() {
        let mut config = Config::default();
        config.identity.private_key_path = config.identity.public_key_path.clone();
        assert!(matches!(config.validate(), Err(ConfigError::SameKeyPaths(_))));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.logging.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );

        config.logging.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("devshell"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_host_and_port() {
        std::env::set_var("DEVSHELL_HOST", "192.168.1.137");
        std::env::set_var("DEVSHELL_PORT", "5556");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.remote.host, "192.168.1.137");
        assert_eq!(config.remote.port, 5556);

        std::env::remove_var("DEVSHELL_HOST");
        std::env::remove_var("DEVSHELL_PORT");
    }

    #[test]
    #[serial]
    fn test_env_override_bad_port_is_ignored() {
        std::env::set_var("DEVSHELL_PORT", "not-a-port");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.remote.port, DEFAULT_PORT);

        std::env::remove_var("DEVSHELL_PORT");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("DEVSHELL_HOST", "");
        std::env::set_var("DEVSHELL_LOG_LEVEL", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());

        std::env::remove_var("DEVSHELL_HOST");
        std::env::remove_var("DEVSHELL_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::set_var("DEVSHELL_LOG_LEVEL", "trace");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.logging.log_level, "trace");

        std::env::remove_var("DEVSHELL_LOG_LEVEL");
    }
}
