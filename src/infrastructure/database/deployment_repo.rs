use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::domain::error::DatabaseError;
use crate::domain::models::{AppId, Deployment, DeploymentId, DeploymentStatus};
use crate::domain::ports::DeploymentRepository;
use crate::infrastructure::database::utils::{format_datetime, parse_datetime, parse_datetime_opt};

/// Marker appended once when a deployment's stored logs hit the cap.
pub const TRUNCATION_MARKER: &str = "\n[logs truncated]\n";

/// SQLite implementation of `DeploymentRepository` using sqlx.
pub struct DeploymentRepositoryImpl {
    pool: SqlitePool,
}

impl DeploymentRepositoryImpl {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_deployment(row: &sqlx::sqlite::SqliteRow) -> Result<Deployment, DatabaseError> {
        let status_str: String = row.get("status");
        let status = DeploymentStatus::from_str(&status_str)
            .ok_or_else(|| DatabaseError::SerializationError(format!("bad status {status_str:?}")))?;
        Ok(Deployment {
            id: DeploymentId(uuid::Uuid::parse_str(row.get::<String, _>("id").as_str())?),
            app_id: AppId(uuid::Uuid::parse_str(row.get::<String, _>("app_id").as_str())?),
            commit_sha: row.get("commit_sha"),
            commit_message: row.get("commit_message"),
            status,
            started_at: parse_datetime_opt(row.get::<Option<String>, _>("started_at").as_deref())?,
            finished_at: parse_datetime_opt(row.get::<Option<String>, _>("finished_at").as_deref())?,
            error_message: row.get("error_message"),
            logs: row.get("logs"),
            previous_image_tag: row.get("previous_image_tag"),
            current_image_tag: row.get("current_image_tag"),
            created_at: parse_datetime(row.get::<String, _>("created_at").as_str())?,
        })
    }
}

#[async_trait]
impl DeploymentRepository for DeploymentRepositoryImpl {
    async fn create(&self, deployment: &Deployment) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO deployments
             (id, app_id, commit_sha, commit_message, status, started_at, finished_at,
              error_message, logs, previous_image_tag, current_image_tag, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(deployment.id.to_string())
        .bind(deployment.app_id.to_string())
        .bind(&deployment.commit_sha)
        .bind(&deployment.commit_message)
        .bind(deployment.status.as_str())
        .bind(deployment.started_at.map(format_datetime))
        .bind(deployment.finished_at.map(format_datetime))
        .bind(&deployment.error_message)
        .bind(&deployment.logs)
        .bind(&deployment.previous_image_tag)
        .bind(&deployment.current_image_tag)
        .bind(format_datetime(deployment.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: DeploymentId) -> Result<Option<Deployment>, DatabaseError> {
        let row = sqlx::query("SELECT * FROM deployments WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_deployment).transpose()
    }

    async fn list_for_app(&self, app_id: AppId, limit: u32) -> Result<Vec<Deployment>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT * FROM deployments WHERE app_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(app_id.to_string())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_deployment).collect()
    }

    async fn mark_running(&self, id: DeploymentId, started_at: DateTime<Utc>) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE deployments SET status = 'running', started_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(format_datetime(started_at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::QueryFailed(format!(
                "deployment {id} is not pending"
            )));
        }
        Ok(())
    }

    async fn mark_terminal(
        &self,
        id: DeploymentId,
        status: DeploymentStatus,
        error_message: Option<String>,
        finished_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        debug_assert!(status.is_terminal());
        let result = sqlx::query(
            "UPDATE deployments SET status = ?, error_message = ?, finished_at = ?
             WHERE id = ? AND status NOT IN ('success', 'failed', 'cancelled')",
        )
        .bind(status.as_str())
        .bind(&error_message)
        .bind(format_datetime(finished_at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            // Terminal status is monotonic; a second writer lost the race.
            warn!(deployment_id = %id, status = %status, "refused terminal overwrite of terminal deployment");
        }
        Ok(())
    }

    async fn append_logs(&self, id: DeploymentId, text: &str, cap_bytes: usize) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT length(logs) AS len, logs LIKE '%[logs truncated]%' AS truncated FROM deployments WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Err(DatabaseError::RowNotFound);
        };
        let len: i64 = row.get("len");
        let truncated: i64 = row.get("truncated");
        #[allow(clippy::cast_sign_loss)]
        let len = len.max(0) as usize;

        if len >= cap_bytes {
            if truncated == 0 {
                sqlx::query("UPDATE deployments SET logs = logs || ? WHERE id = ?")
                    .bind(TRUNCATION_MARKER)
                    .bind(id.to_string())
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            return Ok(());
        }

        // Clip the chunk so one oversized append cannot blow past the cap.
        let room = cap_bytes - len;
        let chunk = if text.len() > room {
            let mut cut = room;
            while cut > 0 && !text.is_char_boundary(cut) {
                cut -= 1;
            }
            &text[..cut]
        } else {
            text
        };
        sqlx::query("UPDATE deployments SET logs = logs || ? WHERE id = ?")
            .bind(chunk)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_image_tags(
        &self,
        id: DeploymentId,
        previous: Option<&str>,
        current: Option<&str>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE deployments SET
               previous_image_tag = COALESCE(?, previous_image_tag),
               current_image_tag = COALESCE(?, current_image_tag)
             WHERE id = ?",
        )
        .bind(previous)
        .bind(current)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn has_active_for_app(&self, app_id: AppId) -> Result<bool, DatabaseError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM deployments WHERE app_id = ? AND status IN ('pending', 'running')",
        )
        .bind(app_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.get("n");
        Ok(n > 0)
    }
}
