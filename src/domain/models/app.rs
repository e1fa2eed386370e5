//! Application domain model.
//!
//! An app is a source repository plus the runtime configuration needed to
//! build and run it as a container on one of the managed servers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::AppId;

/// HTTP health probe settings for an app's container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    /// Request path, e.g. `/health`.
    pub path: String,
    /// Seconds between probe attempts.
    pub interval_secs: u64,
    /// Total deadline for the whole check, in seconds.
    pub timeout_secs: u64,
    /// Probe attempts before giving up.
    pub retries: u32,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            interval_secs: 3,
            timeout_secs: 60,
            retries: 5,
        }
    }
}

/// Container resource limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU limit, e.g. `"1.5"`. None means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<String>,
    /// Memory limit in megabytes. None means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
}

/// Runtime configuration blob attached to an app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Port the application listens on inside the container.
    pub port: u16,
    /// Host port the container is published on.
    pub host_port: u16,
    #[serde(default)]
    pub health: HealthCheckSpec,
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Domains routed to this app.
    #[serde(default)]
    pub domains: Vec<String>,
    /// Environment variables injected into the container.
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host_port: 8080,
            health: HealthCheckSpec::default(),
            limits: ResourceLimits::default(),
            domains: Vec::new(),
            env: Vec::new(),
        }
    }
}

/// An application managed by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub id: AppId,
    pub name: String,
    /// Source repository URL.
    pub repo_url: String,
    /// Branch to deploy from.
    pub branch: String,
    /// Sub-directory inside the repository to build from; empty means root.
    pub workdir: String,
    pub config: AppConfig,
    /// Set by the deploy engine on the first successful deploy and on every
    /// one after that.
    pub last_deployed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl App {
    pub fn new(name: impl Into<String>, repo_url: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            id: AppId::new(),
            name: name.into(),
            repo_url: repo_url.into(),
            branch: branch.into(),
            workdir: String::new(),
            config: AppConfig::default(),
            last_deployed_at: None,
            created_at: Utc::now(),
        }
    }

    /// Public URL used for post-deploy health probing.
    pub fn health_url(&self, host: &str) -> String {
        let path = self.config.health.path.trim_start_matches('/');
        format!("http://{}:{}/{}", host, self.config.host_port, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_url_normalizes_leading_slash() {
        let mut app = App::new("web", "https://example.com/web.git", "main");
        app.config.host_port = 9000;
        app.config.health.path = "/healthz".to_string();
        assert_eq!(app.health_url("10.0.0.5"), "http://10.0.0.5:9000/healthz");
    }
}
