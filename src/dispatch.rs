//! Dispatcher: the submission side.
//!
//! `submit` writes a PENDING record, then enqueues the envelope, both under
//! one submit deadline. The two writes are not transactional. If the
//! enqueue fails the record is rolled back to FAILURE (`enqueue_failed`).
//! If that rollback also fails, the record stays PENDING until it expires;
//! this is logged at error level.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::backoff::{BackoffConfig, retry_transient};
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::model::{FailureReason, TaskEnvelope, TaskId, TaskRecord, TaskResult, TaskStatus};
use crate::store::ResultStore;
use crate::telemetry::metrics;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Queue used by [`Dispatcher::submit`].
    pub queue: String,
    /// Upper bound on a whole submission: record write plus enqueue,
    /// retries included.
    pub submit_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue: "tasks".to_string(),
            submit_timeout: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
        }
    }
}

pub struct Dispatcher {
    channel: Arc<dyn Channel>,
    store: Arc<dyn ResultStore>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        channel: Arc<dyn Channel>,
        store: Arc<dyn ResultStore>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            channel,
            store,
            config,
        }
    }

    /// Submit a task to the default queue. Returns its id immediately;
    /// the task itself runs later on some worker.
    pub async fn submit(&self, task_type: &str, args: Vec<Value>) -> Result<TaskId> {
        self.submit_to(&self.config.queue, task_type, args).await
    }

    /// Submit a task to a specific queue.
    pub async fn submit_to(&self, queue: &str, task_type: &str, args: Vec<Value>) -> Result<TaskId> {
        self.dispatch(queue, TaskEnvelope::new(task_type, args)).await
    }

    /// Record and enqueue a prebuilt envelope. The caller already holds the
    /// id, so it can look the rolled-back record up if this fails.
    pub async fn dispatch(&self, queue: &str, envelope: TaskEnvelope) -> Result<TaskId> {
        let task_id = envelope.task_id;
        let task_type = envelope.task_type.as_str();
        let deadline = tokio::time::Instant::now() + self.config.submit_timeout;

        let pending = TaskRecord::pending(&envelope);
        let recorded = tokio::time::timeout_at(deadline, self.store.put(&pending));
        match recorded.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(task_id = %task_id, task_type, queue, "result store did not answer before the submit deadline");
                return Err(Error::BrokerUnavailable(format!(
                    "task record not written within {:?}",
                    self.config.submit_timeout
                )));
            }
        }

        let enqueue = retry_transient(&self.config.backoff, "enqueue", || {
            self.channel.enqueue(queue, &envelope)
        });
        let failure = match tokio::time::timeout_at(deadline, enqueue).await {
            Ok(Ok(())) => {
                metrics::tasks_submitted().add(
                    1,
                    &[
                        KeyValue::new("task_type", task_type.to_string()),
                        KeyValue::new("result", "ok"),
                    ],
                );
                info!(task_id = %task_id, task_type, queue, "task submitted");
                return Ok(task_id);
            }
            Ok(Err(e)) if e.is_transient() => Error::BrokerUnavailable(e.to_string()),
            Ok(Err(e)) => e,
            Err(_) => Error::BrokerUnavailable(format!(
                "no broker acknowledgement within {:?}",
                self.config.submit_timeout
            )),
        };

        warn!(task_id = %task_id, task_type, queue, "enqueue failed: {failure}");
        metrics::tasks_submitted().add(
            1,
            &[
                KeyValue::new("task_type", task_type.to_string()),
                KeyValue::new("result", "enqueue_failed"),
            ],
        );

        // The rollback gets whatever is left of the deadline, then carries on
        // in the background so the caller is not held past it.
        let store = Arc::clone(&self.store);
        let result = TaskResult::failure(FailureReason::EnqueueFailed, failure.to_string());
        let rollback = tokio::spawn(async move {
            if let Err(e) = store.transition(task_id, TaskStatus::Failure, Some(result)).await {
                error!(
                    task_id = %task_id,
                    "rollback to FAILURE failed, record stays PENDING until expiry: {e}"
                );
            }
        });
        if tokio::time::timeout_at(deadline, rollback).await.is_err() {
            debug!(task_id = %task_id, "rollback continues past the submit deadline");
        }

        Err(failure)
    }
}
