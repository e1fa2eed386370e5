//! Deployment domain model.
//!
//! A deployment is one attempt to take an app from a commit to a running
//! container. Its status machine is forward-only: once terminal, frozen.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AppId, DeploymentId};

/// Status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Recorded but not yet picked up by a worker.
    Pending,
    /// A worker is executing it.
    Running,
    /// Container swapped and healthy.
    Success,
    /// Build, agent or health check failed (rollback may have run).
    Failed,
    /// Rejected before running: lock contention or missing app.
    Cancelled,
}

impl Default for DeploymentStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    /// Valid transitions from this status. Terminal states admit none.
    pub fn valid_transitions(&self) -> &'static [DeploymentStatus] {
        match self {
            Self::Pending => &[Self::Running, Self::Cancelled],
            Self::Running => &[Self::Success, Self::Failed],
            Self::Success | Self::Failed | Self::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One deployment attempt of an app.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub app_id: AppId,
    pub commit_sha: String,
    pub commit_message: String,
    pub status: DeploymentStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Accumulated build/run log text, capped by the repository layer.
    pub logs: String,
    /// Image tag that was live before this deployment; rollback target.
    pub previous_image_tag: Option<String>,
    /// Image tag produced by this deployment.
    pub current_image_tag: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Deployment {
    pub fn new(app_id: AppId, commit_sha: impl Into<String>, commit_message: impl Into<String>) -> Self {
        Self {
            id: DeploymentId::new(),
            app_id,
            commit_sha: commit_sha.into(),
            commit_message: commit_message.into(),
            status: DeploymentStatus::Pending,
            started_at: None,
            finished_at: None,
            error_message: None,
            logs: String::new(),
            previous_image_tag: None,
            current_image_tag: None,
            created_at: Utc::now(),
        }
    }
}
