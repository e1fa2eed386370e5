use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::error::DatabaseError;
use crate::domain::models::{AppId, Deployment, DeploymentId, DeploymentStatus};

/// Persistence boundary for deployments.
///
/// Status writes are expected to respect the forward-only machine; the
/// engine checks transitions before calling in, and `mark_terminal` refuses
/// to overwrite an already-terminal row as a second line of defence.
#[async_trait]
pub trait DeploymentRepository: Send + Sync {
    async fn create(&self, deployment: &Deployment) -> Result<(), DatabaseError>;

    async fn get(&self, id: DeploymentId) -> Result<Option<Deployment>, DatabaseError>;

    async fn list_for_app(&self, app_id: AppId, limit: u32) -> Result<Vec<Deployment>, DatabaseError>;

    /// Pending → Running, stamping `started_at`.
    async fn mark_running(&self, id: DeploymentId, started_at: DateTime<Utc>) -> Result<(), DatabaseError>;

    /// Move into a terminal status, stamping `finished_at` and the error
    /// message if any. Rows already terminal are left untouched.
    async fn mark_terminal(
        &self,
        id: DeploymentId,
        status: DeploymentStatus,
        error_message: Option<String>,
        finished_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Append log text, enforcing `cap_bytes` with a truncation marker.
    async fn append_logs(&self, id: DeploymentId, text: &str, cap_bytes: usize) -> Result<(), DatabaseError>;

    async fn set_image_tags(
        &self,
        id: DeploymentId,
        previous: Option<&str>,
        current: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// True if the app has a deployment in a non-terminal status.
    async fn has_active_for_app(&self, app_id: AppId) -> Result<bool, DatabaseError>;
}
