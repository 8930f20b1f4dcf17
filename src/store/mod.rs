//! Result store: task id → task record, with TTL expiry.
//!
//! Each key has one logical writer at a time (the dispatcher, then whichever
//! worker holds the delivery), so no cross-writer locking is needed. Racing
//! writes resolve last-write-wins on `updated_at`.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::{TaskId, TaskRecord, TaskResult, TaskStatus};
use crate::telemetry::metrics;

pub use memory::MemoryResultStore;

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Write a record. Ignored if the stored record has a newer `updated_at`.
    async fn put(&self, record: &TaskRecord) -> Result<()>;

    /// Read a record. Expired records read as `None`.
    async fn get(&self, task_id: TaskId) -> Result<Option<TaskRecord>>;

    /// Delete every expired record. Returns how many were removed.
    async fn purge_expired(&self) -> Result<u64>;

    /// Read, validate, and write one status transition.
    async fn transition(
        &self,
        task_id: TaskId,
        to: TaskStatus,
        result: Option<TaskResult>,
    ) -> Result<TaskRecord> {
        let current = self
            .get(task_id)
            .await?
            .ok_or_else(|| Error::NotFound(task_id.to_string()))?;
        let from = current.status;
        let next = current.transition(to, result)?;
        self.put(&next).await?;

        metrics::task_state_transitions().add(
            1,
            &[
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );
        Ok(next)
    }
}

/// Whether a record last written at `updated_at` has outlived `ttl`.
pub(crate) fn is_expired(updated_at: chrono::DateTime<chrono::Utc>, ttl: Duration) -> bool {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    match updated_at.checked_add_signed(ttl) {
        Some(expires_at) => expires_at <= chrono::Utc::now(),
        None => false,
    }
}

/// Periodically purge expired records until `cancel` fires.
pub fn spawn_reaper(
    store: Arc<dyn ResultStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(n) => info!(purged = n, "expired task records purged"),
                Err(e) => warn!("purge_expired failed: {e}"),
            }
        }
    })
}
