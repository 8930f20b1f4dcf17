//! pgmq queue operations via direct SQLx, and the [`Channel`] built on them.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.set_vt, pgmq.archive, pgmq.delete. pgmq provides the visibility
//! timeout and the per-message read count natively.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;

use super::{Db, unavailable};
use crate::channel::{AckHandle, Channel, Delivery};
use crate::error::{Error, Result};
use crate::model::TaskEnvelope;
use crate::telemetry::metrics;

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub vt: chrono::DateTime<chrono::Utc>,
    pub message: serde_json::Value,
}

fn record_op(queue_name: &str, operation: &'static str) {
    metrics::channel_operations().add(
        1,
        &[
            KeyValue::new("queue", queue_name.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

impl Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(self.pool())
            .await
            .map_err(unavailable)?;
        record_op(queue_name, "create");
        Ok(())
    }

    /// Send a message to a pgmq queue. Returns the message ID.
    /// delay_seconds: 0 for immediate, >0 for delayed delivery.
    pub async fn send_to_queue(
        &self,
        queue_name: &str,
        payload: &serde_json::Value,
        delay_seconds: i32,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(queue_name)
            .bind(payload)
            .bind(delay_seconds)
            .fetch_one(self.pool())
            .await
            .map_err(unavailable)?;
        record_op(queue_name, "send");
        Ok(row.0)
    }

    /// Read the next message from a queue (visibility timeout in seconds).
    /// Returns None if queue is empty.
    pub async fn read_from_queue(
        &self,
        queue_name: &str,
        vt_seconds: i32,
    ) -> Result<Option<PgmqMessage>> {
        let row = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >("SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, 1)")
        .bind(queue_name)
        .bind(vt_seconds)
        .fetch_optional(self.pool())
        .await
        .map_err(unavailable)?;

        let msg = row.map(|(msg_id, read_ct, enqueued_at, vt, message)| PgmqMessage {
            msg_id,
            read_ct,
            enqueued_at,
            vt,
            message,
        });

        record_op(queue_name, if msg.is_some() { "read" } else { "read_empty" });
        Ok(msg)
    }

    /// Move a message's visibility deadline to `vt_seconds` from now.
    /// 0 makes it visible immediately. Returns false if the message is gone.
    pub async fn set_visibility(&self, queue_name: &str, msg_id: i64, vt_seconds: i32) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT msg_id FROM pgmq.set_vt($1, $2, $3)")
            .bind(queue_name)
            .bind(msg_id)
            .bind(vt_seconds)
            .fetch_optional(self.pool())
            .await
            .map_err(unavailable)?;
        record_op(queue_name, "set_vt");
        Ok(row.is_some())
    }

    /// Archive a message (moves to archive table, preserves for audit).
    pub async fn archive_message(&self, queue_name: &str, msg_id: i64) -> Result<bool> {
        let row: (bool,) = sqlx::query_as("SELECT pgmq.archive($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .fetch_one(self.pool())
            .await
            .map_err(unavailable)?;
        record_op(queue_name, "archive");
        Ok(row.0)
    }

    /// Delete a message permanently.
    pub async fn delete_message(&self, queue_name: &str, msg_id: i64) -> Result<bool> {
        let row: (bool,) = sqlx::query_as("SELECT pgmq.delete($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .fetch_one(self.pool())
            .await
            .map_err(unavailable)?;
        record_op(queue_name, "delete");
        Ok(row.0)
    }
}

/// [`Channel`] over pgmq.
///
/// Stale-handle detection is weaker than the in-memory channel's: pgmq
/// tracks no per-delivery receipt, so an ack from a consumer whose window
/// lapsed succeeds as long as the message still exists.
pub struct PgmqChannel {
    db: Arc<Db>,
    visibility_timeout: Duration,
}

impl PgmqChannel {
    pub fn new(db: Arc<Db>, visibility_timeout: Duration) -> Self {
        Self {
            db,
            visibility_timeout,
        }
    }

    fn vt_seconds(&self) -> i32 {
        self.visibility_timeout.as_secs().clamp(1, i32::MAX as u64) as i32
    }
}

fn stale(handle: &AckHandle) -> Error {
    Error::StaleDelivery(format!("message {} on {}", handle.msg_id, handle.queue))
}

#[async_trait]
impl Channel for PgmqChannel {
    async fn ensure_queue(&self, queue: &str) -> Result<()> {
        self.db.create_queue(queue).await
    }

    async fn enqueue(&self, queue: &str, envelope: &TaskEnvelope) -> Result<()> {
        let payload = serde_json::to_value(envelope)?;
        self.db.send_to_queue(queue, &payload, 0).await?;
        Ok(())
    }

    async fn receive(&self, queue: &str) -> Result<Option<Delivery>> {
        let Some(msg) = self.db.read_from_queue(queue, self.vt_seconds()).await? else {
            return Ok(None);
        };

        let mut envelope: TaskEnvelope = match serde_json::from_value(msg.message) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Poison message: nothing can ever process it.
                tracing::error!(queue, msg_id = msg.msg_id, "undecodable envelope, archiving: {e}");
                self.db.archive_message(queue, msg.msg_id).await?;
                return Ok(None);
            }
        };
        envelope.delivery_count = (msg.read_ct - 1).max(0) as u32;

        Ok(Some(Delivery {
            envelope,
            handle: AckHandle {
                queue: queue.to_string(),
                msg_id: msg.msg_id,
                receipt: i64::from(msg.read_ct),
            },
        }))
    }

    async fn ack(&self, handle: &AckHandle) -> Result<()> {
        if self.db.delete_message(&handle.queue, handle.msg_id).await? {
            Ok(())
        } else {
            Err(stale(handle))
        }
    }

    async fn nack(&self, handle: &AckHandle, requeue: bool) -> Result<()> {
        let found = if requeue {
            self.db
                .set_visibility(&handle.queue, handle.msg_id, 0)
                .await?
        } else {
            self.db.archive_message(&handle.queue, handle.msg_id).await?
        };
        if found { Ok(()) } else { Err(stale(handle)) }
    }

    async fn extend(&self, handle: &AckHandle, by: Duration) -> Result<()> {
        let secs = by.as_secs_f64().ceil().clamp(1.0, f64::from(i32::MAX)) as i32;
        if self
            .db
            .set_visibility(&handle.queue, handle.msg_id, secs)
            .await?
        {
            Ok(())
        } else {
            Err(stale(handle))
        }
    }
}
