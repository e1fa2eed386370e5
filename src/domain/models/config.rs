//! Control plane configuration.
//!
//! Loaded once at startup by the figment-based loader and immutable after
//! that; every section has serde defaults so a bare install works.

use serde::{Deserialize, Serialize};

/// Database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path.
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: ".caravel/caravel.db".to_string(), max_connections: 10 }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub level: String,
    /// json | pretty
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "json".to_string() }
    }
}

/// Control channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Address the plane's control listener binds to.
    pub bind: String,
    /// Plane listener port (Register/Heartbeat).
    pub port: u16,
    /// Port agents listen on for plane-initiated RPCs.
    pub agent_port: u16,
    /// Heartbeat cadence handed to agents in the Register response.
    pub heartbeat_interval_secs: u64,
    /// A server is online iff it heartbeated within this window.
    pub liveness_window_secs: u64,
    /// Per-RPC deadline for plane-to-agent unary calls.
    pub rpc_timeout_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 50051,
            agent_port: 50052,
            heartbeat_interval_secs: 30,
            liveness_window_secs: 90,
            rpc_timeout_secs: 30,
        }
    }
}

/// Deploy engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Worker pool size: at most this many deploys run at once.
    pub workers: usize,
    /// Global deadline per deploy, in seconds.
    pub timeout_secs: u64,
    /// Cap on persisted log text per deployment, in bytes.
    pub log_cap_bytes: usize,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self { workers: 2, timeout_secs: 600, log_cap_bytes: 4 * 1024 * 1024 }
    }
}

/// Defaults for app health probing; per-app settings override these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub timeout_secs: u64,
    pub interval_secs: u64,
    pub retries: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { timeout_secs: 60, interval_secs: 3, retries: 5 }
    }
}

/// Agent update settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Path to the agent binary served to agents on update.
    pub agent_binary_path: String,
    /// Base URL agents can reach the plane's HTTP surface on.
    pub download_base_url: String,
    /// Single-use download token lifetime, in seconds.
    pub token_ttl_secs: u64,
    /// Chunk size for the direct PushUpdate stream, in bytes.
    pub push_chunk_bytes: usize,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            agent_binary_path: ".caravel/agent/caravel-agent".to_string(),
            download_base_url: "https://localhost:8443".to_string(),
            token_ttl_secs: 300,
            push_chunk_bytes: 256 * 1024,
        }
    }
}

/// HTTP surface settings (download endpoint and event streams).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub bind: String,
    pub port: u16,
    /// Leading path segment of the HTTP surface, e.g. `api/v1`.
    pub prefix: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0".to_string(), port: 8080, prefix: "api/v1".to_string() }
    }
}

/// Top-level configuration for the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for working trees, lock sentinels and PKI material.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

fn default_data_dir() -> String {
    ".caravel".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            control: ControlConfig::default(),
            deploy: DeployConfig::default(),
            health: HealthConfig::default(),
            update: UpdateConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Config {
    /// Directory holding CA material, created 0700 on first use.
    pub fn pki_dir(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("pki")
    }

    /// Directory holding per-app lock sentinels.
    pub fn locks_dir(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join(".locks")
    }
}
