use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::error::DatabaseError;
use crate::domain::models::{Server, ServerId, ServerStatus};

/// Persistence boundary for managed servers.
#[async_trait]
pub trait ServerRepository: Send + Sync {
    async fn create(&self, server: &Server) -> Result<(), DatabaseError>;

    async fn get(&self, id: ServerId) -> Result<Option<Server>, DatabaseError>;

    async fn list(&self) -> Result<Vec<Server>, DatabaseError>;

    async fn set_status(&self, id: ServerId, status: ServerStatus) -> Result<(), DatabaseError>;

    async fn set_agent_version(&self, id: ServerId, version: &str) -> Result<(), DatabaseError>;

    async fn touch_heartbeat(&self, id: ServerId, at: DateTime<Utc>) -> Result<(), DatabaseError>;

    async fn delete(&self, id: ServerId) -> Result<(), DatabaseError>;
}
