use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::error::DatabaseError;
use crate::domain::models::{App, AppConfig, AppId};

/// Persistence boundary for applications.
#[async_trait]
pub trait AppRepository: Send + Sync {
    async fn create(&self, app: &App) -> Result<(), DatabaseError>;

    async fn get(&self, id: AppId) -> Result<Option<App>, DatabaseError>;

    async fn list(&self) -> Result<Vec<App>, DatabaseError>;

    async fn update_config(&self, id: AppId, config: &AppConfig) -> Result<(), DatabaseError>;

    async fn set_last_deployed_at(&self, id: AppId, at: DateTime<Utc>) -> Result<(), DatabaseError>;

    /// Purge the app row; deployment history cascades at the database level.
    async fn delete(&self, id: AppId) -> Result<(), DatabaseError>;
}
