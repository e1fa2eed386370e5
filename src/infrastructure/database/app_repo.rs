use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::domain::error::DatabaseError;
use crate::domain::models::{App, AppConfig, AppId};
use crate::domain::ports::AppRepository;
use crate::infrastructure::database::utils::{format_datetime, parse_datetime, parse_datetime_opt};

/// SQLite implementation of `AppRepository` using sqlx.
pub struct AppRepositoryImpl {
    pool: SqlitePool,
}

impl AppRepositoryImpl {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_app(row: &sqlx::sqlite::SqliteRow) -> Result<App, DatabaseError> {
        let config: AppConfig = serde_json::from_str(&row.get::<String, _>("config"))?;
        Ok(App {
            id: AppId(uuid::Uuid::parse_str(row.get::<String, _>("id").as_str())?),
            name: row.get("name"),
            repo_url: row.get("repo_url"),
            branch: row.get("branch"),
            workdir: row.get("workdir"),
            config,
            last_deployed_at: parse_datetime_opt(
                row.get::<Option<String>, _>("last_deployed_at").as_deref(),
            )?,
            created_at: parse_datetime(row.get::<String, _>("created_at").as_str())?,
        })
    }
}

#[async_trait]
impl AppRepository for AppRepositoryImpl {
    async fn create(&self, app: &App) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO apps (id, name, repo_url, branch, workdir, config, last_deployed_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(app.id.to_string())
        .bind(&app.name)
        .bind(&app.repo_url)
        .bind(&app.branch)
        .bind(&app.workdir)
        .bind(serde_json::to_string(&app.config)?)
        .bind(app.last_deployed_at.map(format_datetime))
        .bind(format_datetime(app.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: AppId) -> Result<Option<App>, DatabaseError> {
        let row = sqlx::query("SELECT * FROM apps WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_app).transpose()
    }

    async fn list(&self) -> Result<Vec<App>, DatabaseError> {
        let rows = sqlx::query("SELECT * FROM apps ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_app).collect()
    }

    async fn update_config(&self, id: AppId, config: &AppConfig) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE apps SET config = ? WHERE id = ?")
            .bind(serde_json::to_string(config)?)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_last_deployed_at(&self, id: AppId, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE apps SET last_deployed_at = ? WHERE id = ?")
            .bind(format_datetime(at))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: AppId) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM apps WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
