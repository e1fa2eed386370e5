//! Server domain model.
//!
//! A server is a registered Linux host: SSH coordinates for provisioning,
//! then agent liveness state once the agent is installed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::ServerId;

/// Status of a managed server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// Registered, provisioning not started.
    Pending,
    /// The provisioner pipeline is running against the host.
    Provisioning,
    /// Agent registered and heartbeating within the liveness window.
    Online,
    /// Agent installed but heartbeats have stopped.
    Offline,
    /// Provisioning failed; see provision events for the step.
    Failed,
}

impl Default for ServerStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "provisioning" => Some(Self::Provisioning),
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SSH credentials used once, during provisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SshCredentials {
    Password { password: String },
    PrivateKey { key_pem: String },
}

/// A Linux host managed by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub host: String,
    pub ssh_port: u16,
    /// User the agent is installed and run as.
    pub install_user: String,
    pub credentials: SshCredentials,
    /// Email handed to the TLS-terminating proxy for ACME registration.
    pub acme_email: String,
    /// Version the agent reported on its last Register/Heartbeat.
    pub agent_version: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub status: ServerStatus,
    pub created_at: DateTime<Utc>,
}

impl Server {
    pub fn new(host: impl Into<String>, install_user: impl Into<String>, credentials: SshCredentials) -> Self {
        Self {
            id: ServerId::new(),
            host: host.into(),
            ssh_port: 22,
            install_user: install_user.into(),
            credentials,
            acme_email: String::new(),
            agent_version: None,
            last_heartbeat: None,
            status: ServerStatus::Pending,
            created_at: Utc::now(),
        }
    }
}
