//! In-process channel with pgmq-style visibility timeouts.
//!
//! Messages live in a per-queue ready list and an in-flight map keyed by
//! message id. Expired in-flight messages are moved back to the ready list
//! lazily, on the next receive.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use super::{AckHandle, Channel, Delivery};
use crate::error::{Error, Result};
use crate::model::TaskEnvelope;

struct Message {
    msg_id: i64,
    envelope: TaskEnvelope,
    /// How many times this message has been handed out.
    reads: u32,
}

struct InFlight {
    message: Message,
    receipt: i64,
    visible_at: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    in_flight: HashMap<i64, InFlight>,
}

impl QueueState {
    /// Remove the in-flight entry only if the handle is for its current delivery.
    fn take_in_flight(&mut self, handle: &AckHandle) -> Option<InFlight> {
        let current = self
            .in_flight
            .get(&handle.msg_id)
            .is_some_and(|f| f.receipt == handle.receipt);
        if current {
            self.in_flight.remove(&handle.msg_id)
        } else {
            None
        }
    }

    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<i64> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(f) = self.in_flight.remove(&id) {
                debug!(msg_id = id, "visibility timeout lapsed, message visible again");
                self.ready.push_back(f.message);
            }
        }
    }
}

/// Counts for one queue, for inspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub visible: usize,
    pub in_flight: usize,
}

pub struct MemoryChannel {
    visibility_timeout: Duration,
    queues: Mutex<HashMap<String, QueueState>>,
    ready: Notify,
    next_id: AtomicI64,
    online: AtomicBool,
}

impl MemoryChannel {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            visibility_timeout,
            queues: Mutex::new(HashMap::new()),
            ready: Notify::new(),
            next_id: AtomicI64::new(1),
            online: AtomicBool::new(true),
        }
    }

    /// Simulate a broker outage (`false`) or recovery (`true`).
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub async fn stats(&self, queue: &str) -> QueueStats {
        let mut queues = self.queues.lock().await;
        match queues.get_mut(queue) {
            Some(state) => {
                state.reclaim_expired(Instant::now());
                QueueStats {
                    visible: state.ready.len(),
                    in_flight: state.in_flight.len(),
                }
            }
            None => QueueStats {
                visible: 0,
                in_flight: 0,
            },
        }
    }

    fn check_online(&self) -> Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::ChannelUnavailable("memory channel offline".to_string()))
        }
    }

    fn stale(handle: &AckHandle) -> Error {
        Error::StaleDelivery(format!(
            "message {} on {} (receipt {})",
            handle.msg_id, handle.queue, handle.receipt
        ))
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn ensure_queue(&self, queue: &str) -> Result<()> {
        self.check_online()?;
        self.queues
            .lock()
            .await
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn enqueue(&self, queue: &str, envelope: &TaskEnvelope) -> Result<()> {
        self.check_online()?;
        let msg_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.queues
            .lock()
            .await
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(Message {
                msg_id,
                envelope: envelope.clone(),
                reads: 0,
            });
        self.ready.notify_waiters();
        Ok(())
    }

    async fn receive(&self, queue: &str) -> Result<Option<Delivery>> {
        self.check_online()?;
        let now = Instant::now();
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };

        state.reclaim_expired(now);
        let Some(mut message) = state.ready.pop_front() else {
            return Ok(None);
        };

        message.envelope.delivery_count = message.reads;
        message.reads += 1;

        let receipt = self.next_id.fetch_add(1, Ordering::SeqCst);
        let delivery = Delivery {
            envelope: message.envelope.clone(),
            handle: AckHandle {
                queue: queue.to_string(),
                msg_id: message.msg_id,
                receipt,
            },
        };
        state.in_flight.insert(
            message.msg_id,
            InFlight {
                message,
                receipt,
                visible_at: now + self.visibility_timeout,
            },
        );
        Ok(Some(delivery))
    }

    async fn ack(&self, handle: &AckHandle) -> Result<()> {
        self.check_online()?;
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(&handle.queue)
            .ok_or_else(|| Self::stale(handle))?;
        state
            .take_in_flight(handle)
            .map(|_| ())
            .ok_or_else(|| Self::stale(handle))
    }

    async fn nack(&self, handle: &AckHandle, requeue: bool) -> Result<()> {
        self.check_online()?;
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(&handle.queue)
            .ok_or_else(|| Self::stale(handle))?;
        let f = state
            .take_in_flight(handle)
            .ok_or_else(|| Self::stale(handle))?;

        if requeue {
            state.ready.push_back(f.message);
            drop(queues);
            self.ready.notify_waiters();
        }
        Ok(())
    }

    async fn extend(&self, handle: &AckHandle, by: Duration) -> Result<()> {
        self.check_online()?;
        let mut queues = self.queues.lock().await;
        let held = queues
            .get_mut(&handle.queue)
            .and_then(|state| state.in_flight.get_mut(&handle.msg_id))
            .filter(|f| f.receipt == handle.receipt)
            .ok_or_else(|| Self::stale(handle))?;
        held.visible_at = Instant::now() + by;
        Ok(())
    }

    async fn wait_ready(&self, _queue: &str, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.ready.notified()).await;
    }
}
