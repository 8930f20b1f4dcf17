//! Postgres-backed result store (`task_results` table).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Db;
use crate::error::{Error, Result};
use crate::model::{TaskId, TaskRecord, TaskResult};
use crate::store::ResultStore;

pub struct PgResultStore {
    db: Arc<Db>,
    ttl: Duration,
}

impl PgResultStore {
    pub fn new(db: Arc<Db>, ttl: Duration) -> Self {
        Self { db, ttl }
    }

    /// Records last written at or before this instant are expired.
    fn cutoff(&self) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        Utc::now()
            .checked_sub_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[async_trait]
impl ResultStore for PgResultStore {
    async fn put(&self, record: &TaskRecord) -> Result<()> {
        let result = record.result.as_ref().map(serde_json::to_value).transpose()?;

        // Last-write-wins: an older write never clobbers a newer one.
        sqlx::query(
            "INSERT INTO task_results (task_id, task_type, status, result, retries, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (task_id) DO UPDATE SET
                status = EXCLUDED.status,
                result = EXCLUDED.result,
                retries = EXCLUDED.retries,
                updated_at = EXCLUDED.updated_at
             WHERE task_results.updated_at <= EXCLUDED.updated_at",
        )
        .bind(record.task_id.0)
        .bind(&record.task_type)
        .bind(record.status.to_string())
        .bind(result)
        .bind(record.retries as i32)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<TaskRecord>> {
        let row: Option<TaskResultRow> = sqlx::query_as(
            "SELECT task_id, task_type, status, result, retries, created_at, updated_at
             FROM task_results WHERE task_id = $1 AND updated_at > $2",
        )
        .bind(task_id.0)
        .bind(self.cutoff())
        .fetch_optional(self.db.pool())
        .await?;

        row.map(TaskResultRow::try_into_record).transpose()
    }

    async fn purge_expired(&self) -> Result<u64> {
        let purged = sqlx::query("DELETE FROM task_results WHERE updated_at <= $1")
            .bind(self.cutoff())
            .execute(self.db.pool())
            .await?
            .rows_affected();
        Ok(purged)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskResultRow {
    task_id: Uuid,
    task_type: String,
    status: String,
    result: Option<serde_json::Value>,
    retries: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskResultRow {
    fn try_into_record(self) -> Result<TaskRecord> {
        let result: Option<TaskResult> = self
            .result
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| Error::Other(format!("bad result payload for {}: {e}", self.task_id)))?;

        Ok(TaskRecord {
            task_id: TaskId(self.task_id),
            task_type: self.task_type,
            status: self.status.parse()?,
            result,
            retries: self.retries.max(0) as u32,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
