//! Configuration management for the event bus broker.
//!
//! Settings come from a TOML file, created with defaults on first start, and
//! can be overridden from the command line.

use crate::cli::CliArgs;
use anyhow::Context;
use event_bus::wire::DEFAULT_MAX_LINE_LENGTH;
use event_bus::{ServerConfig, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub monitoring: MonitoringSettings,
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Network address to bind the broker to (e.g., "127.0.0.1:5532")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Maximum number of concurrent client connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Longest accepted protocol line in bytes
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

fn default_bind_address() -> String {
    format!("127.0.0.1:{DEFAULT_PORT}")
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_connections: default_max_connections(),
            max_line_length: default_max_line_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSettings {
    /// Seconds between periodic stats log lines (0 disables them)
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_stats_interval() -> u64 {
    60
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            stats_interval_secs: default_stats_interval(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from `path`, writing a default file there first
    /// if none exists.
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
                .with_context(|| format!("writing {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Applies command-line overrides on top of the file values.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(bind_address) = &args.bind_address {
            self.server.bind_address = bind_address.clone();
        }
        if let Some(log_level) = &args.log_level {
            self.logging.level = log_level.clone();
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self
            .server
            .bind_address
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            return Err(format!("Invalid bind address: {}", self.server.bind_address));
        }

        if self.server.max_connections == 0 {
            return Err("max_connections must be greater than 0".to_string());
        }
        if self.server.max_line_length == 0 {
            return Err("max_line_length must be greater than 0".to_string());
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, VALID_LOG_LEVELS
            ));
        }

        Ok(())
    }

    pub fn to_server_config(&self) -> anyhow::Result<ServerConfig> {
        Ok(ServerConfig {
            bind_address: self
                .server
                .bind_address
                .parse()
                .with_context(|| format!("invalid bind address {}", self.server.bind_address))?,
            max_connections: self.server.max_connections,
            max_line_length: self.server.max_line_length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();

        assert_eq!(config.server.bind_address, "127.0.0.1:5532");
        assert_eq!(config.server.max_connections, 1000);
        assert_eq!(config.server.max_line_length, 1024 * 1024);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json_format);
        assert_eq!(config.monitoring.stats_interval_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_load_from_nonexistent_file_creates_it() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("event_bus.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:5532");
        assert!(path.exists());

        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded.server.bind_address, config.server.bind_address);
        assert_eq!(reloaded.monitoring.stats_interval_secs, 60);
    }

    #[tokio::test]
    async fn test_load_from_existing_file() {
        let toml_content = r#"
[server]
bind_address = "0.0.0.0:6000"
max_connections = 50
max_line_length = 4096

[logging]
level = "debug"
json_format = true

[monitoring]
stats_interval_secs = 0
"#;
        let temp_file = NamedTempFile::new().unwrap();
        tokio::fs::write(temp_file.path(), toml_content).await.unwrap();

        let config = AppConfig::load_from_file(temp_file.path()).await.unwrap();
        assert_eq!(config.server.bind_address, "0.0.0.0:6000");
        assert_eq!(config.server.max_connections, 50);
        assert_eq!(config.server.max_line_length, 4096);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);
        assert_eq!(config.monitoring.stats_interval_secs, 0);
    }

    #[tokio::test]
    async fn test_missing_sections_use_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        tokio::fs::write(temp_file.path(), "[server]\nmax_connections = 10\n")
            .await
            .unwrap();

        let config = AppConfig::load_from_file(temp_file.path()).await.unwrap();
        assert_eq!(config.server.max_connections, 10);
        assert_eq!(config.server.bind_address, "127.0.0.1:5532");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.monitoring.stats_interval_secs, 60);
    }

    #[tokio::test]
    async fn test_malformed_file_is_an_error() {
        let temp_file = NamedTempFile::new().unwrap();
        tokio::fs::write(temp_file.path(), "[server\nbind_address = ").await.unwrap();
        assert!(AppConfig::load_from_file(temp_file.path()).await.is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = AppConfig::default();

        config.server.bind_address = "invalid".to_string();
        assert!(config.validate().is_err());
        config.server.bind_address = "127.0.0.1:5532".to_string();

        config.server.max_connections = 0;
        assert!(config.validate().is_err());
        config.server.max_connections = 1;

        config.server.max_line_length = 0;
        assert!(config.validate().is_err());
        config.server.max_line_length = 64;

        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());

        for level in VALID_LOG_LEVELS {
            config.logging.level = level.to_string();
            assert!(config.validate().is_ok());
        }
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = AppConfig::default();
        let args = CliArgs {
            config_path: PathBuf::from("unused.toml"),
            bind_address: Some("0.0.0.0:7000".to_string()),
            log_level: None,
            json_logs: true,
        };

        config.apply_cli_overrides(&args);
        assert_eq!(config.server.bind_address, "0.0.0.0:7000");
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.json_format);
    }

    #[test]
    fn test_to_server_config_conversion() {
        let mut config = AppConfig::default();
        config.server.bind_address = "0.0.0.0:7000".to_string();
        config.server.max_connections = 12;

        let server_config = config.to_server_config().unwrap();
        assert_eq!(server_config.bind_address, "0.0.0.0:7000".parse().unwrap());
        assert_eq!(server_config.max_connections, 12);
        assert_eq!(server_config.max_line_length, 1024 * 1024);
    }
}
