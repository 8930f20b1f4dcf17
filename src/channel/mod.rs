//! Message channel: durable per-queue transport for task envelopes.
//!
//! Delivery is at-least-once. A received envelope stays invisible to other
//! consumers for the visibility timeout; if it is not acked or extended in
//! time it becomes visible again with `delivery_count` incremented.
//!
//! Implementations: [`memory::MemoryChannel`] for tests and single-process
//! use, and [`crate::db::pgmq::PgmqChannel`] backed by Postgres pgmq.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::TaskEnvelope;

pub use memory::MemoryChannel;

/// Opaque proof of a single delivery. Needed to ack or nack it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckHandle {
    pub(crate) queue: String,
    pub(crate) msg_id: i64,
    /// Distinguishes successive deliveries of the same message.
    pub(crate) receipt: i64,
}

impl AckHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn msg_id(&self) -> i64 {
        self.msg_id
    }
}

/// An envelope handed to one consumer, plus the handle to settle it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: TaskEnvelope,
    pub handle: AckHandle,
}

#[async_trait]
pub trait Channel: Send + Sync {
    /// Create the queue if it does not exist. Idempotent.
    async fn ensure_queue(&self, queue: &str) -> Result<()>;

    /// Append an envelope to the queue.
    async fn enqueue(&self, queue: &str, envelope: &TaskEnvelope) -> Result<()>;

    /// Take the next visible envelope, or `None` if there is none right now.
    async fn receive(&self, queue: &str) -> Result<Option<Delivery>>;

    /// Remove a delivered envelope for good.
    async fn ack(&self, handle: &AckHandle) -> Result<()>;

    /// Give a delivery back. With `requeue` it becomes visible immediately;
    /// without, it is dropped from the queue.
    async fn nack(&self, handle: &AckHandle, requeue: bool) -> Result<()>;

    /// Keep a delivery invisible for another `by`, counted from now. Called
    /// while a handler is still running so the envelope is not handed out
    /// again. Fails with `StaleDelivery` if the delivery is no longer held.
    async fn extend(&self, handle: &AckHandle, by: Duration) -> Result<()>;

    /// Suspend until the queue may have something to receive, or `max_wait`
    /// elapses. The default just sleeps.
    async fn wait_ready(&self, _queue: &str, max_wait: Duration) {
        tokio::time::sleep(max_wait).await;
    }
}

/// Lazy sequence of deliveries from one queue.
pub struct Consumer {
    channel: Arc<dyn Channel>,
    queue: String,
    poll_interval: Duration,
}

/// Start consuming `queue`. Nothing is read until [`Consumer::next`] is awaited.
pub fn consume(channel: Arc<dyn Channel>, queue: impl Into<String>, poll_interval: Duration) -> Consumer {
    Consumer {
        channel,
        queue: queue.into(),
        poll_interval,
    }
}

impl Consumer {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Suspend until a delivery is available. Errors from the channel are
    /// returned as-is; retrying is the caller's call.
    ///
    /// Cancel-safe: dropping the future before it resolves loses nothing
    /// that the visibility timeout will not bring back.
    pub async fn next(&mut self) -> Result<Delivery> {
        loop {
            if let Some(delivery) = self.channel.receive(&self.queue).await? {
                return Ok(delivery);
            }
            self.channel
                .wait_ready(&self.queue, self.poll_interval)
                .await;
        }
    }
}
