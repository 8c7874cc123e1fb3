use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use super::{TaskId, TaskKind, TaskQueue, WorkUnit};
use crate::error::SchedulingError;

/// A task taken off the queue by a worker. It stays `running` until completed,
/// retried or failed.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: TaskId,
    pub tag: String,
    pub attempts: u32,
    pub unit: WorkUnit,
}

/// Task queue stored in the `tasks` table.
#[derive(Clone)]
pub struct SqliteTaskQueue {
    pool: SqlitePool,
}

impl SqliteTaskQueue {
    pub fn new(pool: SqlitePool) -> Self {
        SqliteTaskQueue { pool }
    }

    /// Takes the oldest due task, if any. Tasks with unreadable payloads are failed and skipped.
    pub async fn claim_due(&self, now: DateTime<Utc>) -> Result<Option<ClaimedTask>, sqlx::Error> {
        loop {
            let row = sqlx::query(
                "UPDATE tasks
                SET status = 'running', attempts = attempts + 1, updated_at = ?1
                WHERE id = (
                    SELECT id FROM tasks
                    WHERE status = 'pending' AND not_before <= ?1
                    ORDER BY not_before, id
                    LIMIT 1
                )
                RETURNING id, tag, payload, attempts",
            )
            .bind(now.timestamp_millis())
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };

            let id: TaskId = row.try_get("id")?;
            let payload: String = row.try_get("payload")?;
            match serde_json::from_str::<WorkUnit>(&payload) {
                Ok(unit) => {
                    return Ok(Some(ClaimedTask {
                        id,
                        tag: row.try_get("tag")?,
                        attempts: row.try_get::<i64, _>("attempts")? as u32,
                        unit,
                    }))
                }
                Err(e) => {
                    warn!(task = id, error = %e, "Dropping task with unreadable payload");
                    self.fail(id, &e.to_string()).await?;
                }
            }
        }
    }

    /// Finished tasks are removed.
    pub async fn complete(&self, id: TaskId) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn retry(
        &self,
        id: TaskId,
        error: &str,
        not_before: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE tasks SET status = 'pending', not_before = ?, last_error = ?, updated_at = ?
            WHERE id = ?",
        )
        .bind(not_before.timestamp_millis())
        .bind(error)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fail(&self, id: TaskId, error: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE tasks SET status = 'failed', last_error = ?, updated_at = ? WHERE id = ?")
            .bind(error)
            .bind(Utc::now().timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Puts tasks left `running` by a previous process back in line.
    pub async fn requeue_running(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'pending', updated_at = ? WHERE status = 'running'",
        )
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            info!(count = result.rows_affected(), "Requeued interrupted tasks");
        }
        Ok(result.rows_affected())
    }

    /// Number of tasks still waiting to run, across all tags.
    pub async fn pending_total(&self) -> Result<u64, sqlx::Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[async_trait::async_trait]
impl TaskQueue for SqliteTaskQueue {
    async fn submit(
        &self,
        unit: &WorkUnit,
        tag: &str,
        not_before: DateTime<Utc>,
    ) -> Result<TaskId, SchedulingError> {
        let payload = serde_json::to_string(unit)
            .map_err(|e| SchedulingError::Rejected(e.to_string()))?;
        let now = Utc::now().timestamp_millis();
        let id: TaskId = sqlx::query_scalar(
            "INSERT INTO tasks (kind, tag, payload, not_before, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id",
        )
        .bind(unit.kind().as_str())
        .bind(tag)
        .bind(payload)
        .bind(not_before.timestamp_millis())
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn cancel_all_tagged(&self, tag: &str) -> Result<u64, SchedulingError> {
        let result = sqlx::query("DELETE FROM tasks WHERE tag = ? AND status = 'pending'")
            .bind(tag)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_pending(&self, kind: TaskKind, tag: &str) -> Result<u64, SchedulingError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks WHERE tag = ? AND kind = ? AND status = 'pending'",
        )
        .bind(tag)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn queued_units(&self, tag: &str) -> Result<Vec<WorkUnit>, SchedulingError> {
        let payloads: Vec<String> = sqlx::query_scalar(
            "SELECT payload FROM tasks WHERE tag = ? AND status IN ('pending', 'running') ORDER BY id",
        )
        .bind(tag)
        .fetch_all(&self.pool)
        .await?;
        Ok(payloads
            .iter()
            .filter_map(|payload| serde_json::from_str(payload).ok())
            .collect())
    }
}
