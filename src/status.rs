//! Status query: read-only view of the result store.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{TaskId, TaskResult, TaskStatus};
use crate::store::ResultStore;

/// What a caller sees for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub result: Option<TaskResult>,
}

pub struct StatusQuery {
    store: Arc<dyn ResultStore>,
}

impl StatusQuery {
    pub fn new(store: Arc<dyn ResultStore>) -> Self {
        Self { store }
    }

    /// Current status of a task. `None` means it was never submitted or
    /// its record has expired; that is a normal answer, not an error.
    pub async fn get_status(&self, task_id: TaskId) -> Result<Option<TaskStatusReport>> {
        Ok(self
            .store
            .get(task_id)
            .await?
            .map(|record| TaskStatusReport {
                task_id: record.task_id,
                status: record.status,
                result: record.result,
            }))
    }

    /// Poll until the task is terminal, unknown, or `timeout` passes.
    /// Returns the last report seen.
    pub async fn wait_terminal(
        &self,
        task_id: TaskId,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Option<TaskStatusReport>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let report = self.get_status(task_id).await?;
            let done = match &report {
                Some(r) => r.status.is_terminal(),
                None => true,
            };
            if done || tokio::time::Instant::now() >= deadline {
                return Ok(report);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}
