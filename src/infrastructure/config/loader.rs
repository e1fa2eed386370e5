use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::Config;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid worker count: {0}. Must be between 1 and 64")]
    InvalidWorkers(usize),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error("Invalid deploy timeout: {0}s. Must be at least 30s")]
    InvalidDeployTimeout(u64),

    #[error("Invalid log cap: {0} bytes. Must be between 1 MiB and 16 MiB")]
    InvalidLogCap(usize),

    #[error("Invalid token TTL: {0}s. Must be at least 300s")]
    InvalidTokenTtl(u64),

    #[error("Invalid heartbeat interval: {0}s. Must be shorter than the liveness window {1}s")]
    InvalidHeartbeat(u64, u64),

    #[error("Data directory cannot be empty")]
    EmptyDataDir,
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. caravel.yaml (project config)
    /// 3. caravel.local.yaml (local overrides, optional)
    /// 4. Environment variables (CARAVEL_* prefix, highest priority)
    ///
    /// Loaded once at startup; the resulting Config is immutable.
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file("caravel.yaml"))
            .merge(Yaml::file("caravel.local.yaml"))
            .merge(Env::prefixed("CARAVEL_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("CARAVEL_").split("__"))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.data_dir.is_empty() {
            return Err(ConfigError::EmptyDataDir);
        }

        if config.deploy.workers == 0 || config.deploy.workers > 64 {
            return Err(ConfigError::InvalidWorkers(config.deploy.workers));
        }

        if config.deploy.timeout_secs < 30 {
            return Err(ConfigError::InvalidDeployTimeout(config.deploy.timeout_secs));
        }

        if config.deploy.log_cap_bytes < 1024 * 1024 || config.deploy.log_cap_bytes > 16 * 1024 * 1024 {
            return Err(ConfigError::InvalidLogCap(config.deploy.log_cap_bytes));
        }

        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }

        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(
                config.database.max_connections,
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.update.token_ttl_secs < 300 {
            return Err(ConfigError::InvalidTokenTtl(config.update.token_ttl_secs));
        }

        if config.control.heartbeat_interval_secs >= config.control.liveness_window_secs {
            return Err(ConfigError::InvalidHeartbeat(
                config.control.heartbeat_interval_secs,
                config.control.liveness_window_secs,
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.deploy.workers, 2);
        assert_eq!(config.deploy.timeout_secs, 600);
        assert_eq!(config.control.port, 50051);
        assert_eq!(config.control.agent_port, 50052);
        assert_eq!(config.control.heartbeat_interval_secs, 30);
        assert_eq!(config.control.liveness_window_secs, 90);
        assert_eq!(config.update.token_ttl_secs, 300);
        ConfigLoader::validate(&config).expect("Default config should be valid");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r"
data_dir: /var/lib/caravel
deploy:
  workers: 4
  timeout_secs: 300
  log_cap_bytes: 2097152
control:
  port: 6001
  heartbeat_interval_secs: 15
  liveness_window_secs: 45
logging:
  level: debug
  format: pretty
";
        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");

        assert_eq!(config.data_dir, "/var/lib/caravel");
        assert_eq!(config.deploy.workers, 4);
        assert_eq!(config.deploy.timeout_secs, 300);
        assert_eq!(config.control.port, 6001);
        assert_eq!(config.control.heartbeat_interval_secs, 15);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "pretty");
        // Untouched sections keep their defaults.
        assert_eq!(config.database.max_connections, 10);

        ConfigLoader::validate(&config).expect("Parsed config should be valid");
    }

    #[test]
    fn test_validate_zero_workers() {
        let mut config = Config::default();
        config.deploy.workers = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidWorkers(0))
        ));
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        match ConfigLoader::validate(&config).unwrap_err() {
            ConfigError::InvalidLogLevel(level) => assert_eq!(level, "loud"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_validate_log_cap_bounds() {
        let mut config = Config::default();
        config.deploy.log_cap_bytes = 1024;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogCap(1024))
        ));

        config.deploy.log_cap_bytes = 32 * 1024 * 1024;
        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn test_validate_heartbeat_must_fit_liveness_window() {
        let mut config = Config::default();
        config.control.heartbeat_interval_secs = 120;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidHeartbeat(120, 90))
        ));
    }

    #[test]
    fn test_env_override() {
        temp_env::with_vars(
            [
                ("CARAVEL_DEPLOY__WORKERS", Some("8")),
                ("CARAVEL_LOGGING__LEVEL", Some("warn")),
            ],
            || {
                let config: Config = Figment::new()
                    .merge(Serialized::defaults(Config::default()))
                    .merge(Env::prefixed("CARAVEL_").split("__"))
                    .extract()
                    .unwrap();
                assert_eq!(config.deploy.workers, 8);
                assert_eq!(config.logging.level, "warn");
            },
        );
    }
}
