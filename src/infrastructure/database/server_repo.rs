use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::domain::error::DatabaseError;
use crate::domain::models::{Server, ServerId, ServerStatus, SshCredentials};
use crate::domain::ports::ServerRepository;
use crate::infrastructure::database::utils::{format_datetime, parse_datetime, parse_datetime_opt};

/// SQLite implementation of `ServerRepository` using sqlx.
pub struct ServerRepositoryImpl {
    pool: SqlitePool,
}

impl ServerRepositoryImpl {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_server(row: &sqlx::sqlite::SqliteRow) -> Result<Server, DatabaseError> {
        let status_str: String = row.get("status");
        let status = ServerStatus::from_str(&status_str)
            .ok_or_else(|| DatabaseError::SerializationError(format!("bad status {status_str:?}")))?;
        let credentials: SshCredentials = serde_json::from_str(&row.get::<String, _>("credentials"))?;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let ssh_port = row.get::<i64, _>("ssh_port") as u16;
        Ok(Server {
            id: ServerId(uuid::Uuid::parse_str(row.get::<String, _>("id").as_str())?),
            host: row.get("host"),
            ssh_port,
            install_user: row.get("install_user"),
            credentials,
            acme_email: row.get("acme_email"),
            agent_version: row.get("agent_version"),
            last_heartbeat: parse_datetime_opt(row.get::<Option<String>, _>("last_heartbeat").as_deref())?,
            status,
            created_at: parse_datetime(row.get::<String, _>("created_at").as_str())?,
        })
    }
}

#[async_trait]
impl ServerRepository for ServerRepositoryImpl {
    async fn create(&self, server: &Server) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO servers
             (id, host, ssh_port, install_user, credentials, acme_email,
              agent_version, last_heartbeat, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(server.id.to_string())
        .bind(&server.host)
        .bind(i64::from(server.ssh_port))
        .bind(&server.install_user)
        .bind(serde_json::to_string(&server.credentials)?)
        .bind(&server.acme_email)
        .bind(&server.agent_version)
        .bind(server.last_heartbeat.map(format_datetime))
        .bind(server.status.as_str())
        .bind(format_datetime(server.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: ServerId) -> Result<Option<Server>, DatabaseError> {
        let row = sqlx::query("SELECT * FROM servers WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_server).transpose()
    }

    async fn list(&self) -> Result<Vec<Server>, DatabaseError> {
        let rows = sqlx::query("SELECT * FROM servers ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_server).collect()
    }

    async fn set_status(&self, id: ServerId, status: ServerStatus) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE servers SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_agent_version(&self, id: ServerId, version: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE servers SET agent_version = ? WHERE id = ?")
            .bind(version)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_heartbeat(&self, id: ServerId, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE servers SET last_heartbeat = ?, status = 'online' WHERE id = ?")
            .bind(format_datetime(at))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: ServerId) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM servers WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::DatabaseConnection;

    async fn repo() -> ServerRepositoryImpl {
        let db = DatabaseConnection::new("sqlite::memory:", 1).await.unwrap();
        db.migrate().await.unwrap();
        ServerRepositoryImpl::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_create_get_round_trip() {
        let repo = repo().await;
        let server = Server::new(
            "203.0.113.10",
            "deploy",
            SshCredentials::Password { password: "hunter2".into() },
        );
        repo.create(&server).await.unwrap();

        let loaded = repo.get(server.id).await.unwrap().unwrap();
        assert_eq!(loaded.host, "203.0.113.10");
        assert_eq!(loaded.install_user, "deploy");
        assert_eq!(loaded.status, ServerStatus::Pending);
        assert!(loaded.agent_version.is_none());
    }

    #[tokio::test]
    async fn test_touch_heartbeat_sets_online() {
        let repo = repo().await;
        let server = Server::new(
            "203.0.113.11",
            "deploy",
            SshCredentials::PrivateKey { key_pem: "---".into() },
        );
        repo.create(&server).await.unwrap();

        repo.touch_heartbeat(server.id, Utc::now()).await.unwrap();
        let loaded = repo.get(server.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ServerStatus::Online);
        assert!(loaded.last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn test_set_agent_version() {
        let repo = repo().await;
        let server = Server::new(
            "203.0.113.12",
            "deploy",
            SshCredentials::Password { password: "x".into() },
        );
        repo.create(&server).await.unwrap();
        repo.set_agent_version(server.id, "1.0.1").await.unwrap();
        let loaded = repo.get(server.id).await.unwrap().unwrap();
        assert_eq!(loaded.agent_version.as_deref(), Some("1.0.1"));
    }
}
