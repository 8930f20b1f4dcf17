//! Worker pool: consume envelopes, run handlers, record outcomes.
//!
//! Each worker loop pulls one delivery at a time and settles it before
//! pulling the next. Outcomes:
//!
//! - success: SUCCESS + result, ack
//! - retriable failure or timeout: RETRY then PENDING and requeue, until
//!   `delivery_count` reaches `max_retries`; then FAILURE
//!   (`max_retries_exceeded`) and ack
//! - fatal failure or panic: FAILURE, ack
//!
//! If a terminal write to the result store fails the delivery is left
//! unsettled, so the visibility timeout hands it out again.
//!
//! While a handler runs, the worker keeps extending the delivery's
//! visibility so a slow but healthy task is not handed to a second worker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::backoff::{BackoffConfig, calculate_backoff, retry_transient};
use crate::channel::{AckHandle, Channel, Delivery, consume};
use crate::error::{Error, Result};
use crate::model::{FailureReason, TaskRecord, TaskResult, TaskStatus};
use crate::registry::{Handler, HandlerError, HandlerRegistry};
use crate::store::{ResultStore, spawn_reaper};
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue: String,
    /// Number of concurrent worker loops.
    pub concurrency: usize,
    /// Redeliveries allowed after retriable failures.
    pub max_retries: u32,
    /// A handler running longer than this counts as a retriable failure.
    pub execution_timeout: Duration,
    /// Visibility pushed forward on each heartbeat while a handler runs.
    /// Heartbeats fire every third of this. `None` disables extension, in
    /// which case `execution_timeout` must stay below the channel's
    /// visibility timeout.
    pub visibility_extension: Option<Duration>,
    /// Poll interval fallback when the channel gives no wake-up signal.
    pub poll_interval: Duration,
    /// Backoff for channel errors while receiving and settling.
    pub backoff: BackoffConfig,
    /// When set, purge expired result records on this interval.
    pub reap_interval: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: "tasks".to_string(),
            concurrency: 4,
            max_retries: 3,
            execution_timeout: Duration::from_secs(300),
            visibility_extension: Some(Duration::from_secs(30)),
            poll_interval: Duration::from_millis(500),
            backoff: BackoffConfig::default(),
            reap_interval: None,
        }
    }
}

/// How one handler invocation ended.
#[derive(Debug)]
enum Outcome {
    Success(Value),
    Retriable(String),
    Fatal(String),
    Panicked(String),
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::Retriable(_) => "retriable",
            Outcome::Fatal(_) => "fatal",
            Outcome::Panicked(_) => "panicked",
        }
    }
}

/// A set of worker loops sharing one channel, store, and registry.
#[derive(Clone)]
pub struct WorkerPool {
    channel: Arc<dyn Channel>,
    store: Arc<dyn ResultStore>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        channel: Arc<dyn Channel>,
        store: Arc<dyn ResultStore>,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            channel,
            store,
            registry,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop pulling new deliveries. In-flight tasks run to completion (or
    /// their execution timeout) before [`WorkerPool::run`] returns.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run all worker loops until shutdown.
    pub async fn run(&self) -> Result<()> {
        retry_transient(&self.config.backoff, "ensure_queue", || {
            self.channel.ensure_queue(&self.config.queue)
        })
        .await?;

        let reaper = self
            .config
            .reap_interval
            .map(|interval| spawn_reaper(Arc::clone(&self.store), interval, self.shutdown.clone()));

        info!(
            queue = %self.config.queue,
            concurrency = self.config.concurrency,
            handlers = ?self.registry.task_types(),
            "worker pool started"
        );

        let mut workers = JoinSet::new();
        for index in 0..self.config.concurrency.max(1) {
            let pool = self.clone();
            workers.spawn(async move { pool.worker_loop(index).await });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("worker loop aborted: {e}");
            }
        }

        if let Some(reaper) = reaper {
            let _ = reaper.await;
        }

        info!(queue = %self.config.queue, "worker pool stopped");
        Ok(())
    }

    async fn worker_loop(&self, index: usize) {
        let mut consumer = consume(
            Arc::clone(&self.channel),
            self.config.queue.clone(),
            self.config.poll_interval,
        );
        let mut consecutive_errors = 0u32;

        debug!(worker = index, "worker loop started");

        loop {
            // Only the wait for a delivery is cancellable; processing is not.
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = consumer.next() => next,
            };

            match next {
                Ok(delivery) => {
                    consecutive_errors = 0;
                    if let Err(e) = self.process(index, delivery).await {
                        error!(worker = index, "delivery left unsettled: {e}");
                    }
                }
                Err(e) => {
                    let delay = calculate_backoff(&self.config.backoff, consecutive_errors);
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    warn!(
                        worker = index,
                        delay_ms = delay.as_millis() as u64,
                        "receive failed: {e}"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        debug!(worker = index, "worker loop stopped");
    }

    /// Handle one delivery end to end.
    async fn process(&self, index: usize, delivery: Delivery) -> Result<()> {
        let Delivery { envelope, handle } = delivery;
        let span = start_task_span(&envelope, index);

        async {
            let record = match self.store.get(envelope.task_id).await? {
                Some(record) if record.status.is_terminal() => {
                    // Redelivered after a missed ack. Never run a finished task twice.
                    info!(status = %record.status, "task already finished, dropping duplicate delivery");
                    self.ack(&handle).await;
                    return Ok(());
                }
                Some(record) => record,
                None => {
                    warn!("no task record (expired or never written), recreating");
                    TaskRecord::pending(&envelope)
                }
            };
            let record = requeued(record)?;

            let Some(handler) = self.registry.get(&envelope.task_type) else {
                warn!(task_type = %envelope.task_type, "no handler registered for task type");
                metrics::tasks_unroutable()
                    .add(1, &[KeyValue::new("task_type", envelope.task_type.clone())]);
                let from = record.status;
                let failed = record.transition(
                    TaskStatus::Failure,
                    Some(TaskResult::failure(
                        FailureReason::UnknownTaskType,
                        format!("unknown task type: {}", envelope.task_type),
                    )),
                )?;
                self.write(&span, from, &failed).await?;
                self.ack(&handle).await;
                return Ok(());
            };

            // STARTED is for visibility only; carry on even if it is not recorded.
            let from = record.status;
            let record = record.transition(TaskStatus::Started, None)?;
            if let Err(e) = self.write(&span, from, &record).await {
                warn!("could not record STARTED: {e}");
            }

            let started_at = Instant::now();
            let outcome = self.execute(&handle, handler, envelope.args.clone()).await;
            let duration_ms = started_at.elapsed().as_secs_f64() * 1000.0;
            metrics::task_duration_ms().record(
                duration_ms,
                &[
                    KeyValue::new("task_type", envelope.task_type.clone()),
                    KeyValue::new("outcome", outcome.label()),
                ],
            );

            match outcome {
                Outcome::Success(value) => {
                    info!(duration_ms, "task succeeded");
                    let done = record.transition(TaskStatus::Success, Some(TaskResult::value(value)))?;
                    self.write(&span, TaskStatus::Started, &done).await?;
                    self.ack(&handle).await;
                }
                Outcome::Retriable(message) if envelope.delivery_count < self.config.max_retries => {
                    warn!(
                        delivery_count = envelope.delivery_count,
                        max_retries = self.config.max_retries,
                        "retriable failure, requeueing: {message}"
                    );
                    let retry = record.transition(TaskStatus::Retry, None)?;
                    self.write(&span, TaskStatus::Started, &retry).await?;
                    let pending = retry.transition(TaskStatus::Pending, None)?;
                    self.write(&span, TaskStatus::Retry, &pending).await?;
                    self.nack(&handle).await;
                }
                Outcome::Retriable(message) => {
                    warn!(
                        delivery_count = envelope.delivery_count,
                        "retries exhausted: {message}"
                    );
                    let failed = record.transition(
                        TaskStatus::Failure,
                        Some(TaskResult::failure(
                            FailureReason::MaxRetriesExceeded,
                            format!(
                                "gave up after {} redeliveries: {message}",
                                envelope.delivery_count
                            ),
                        )),
                    )?;
                    self.write(&span, TaskStatus::Started, &failed).await?;
                    self.ack(&handle).await;
                }
                Outcome::Fatal(message) => {
                    error!("task failed: {message}");
                    let failed = record.transition(
                        TaskStatus::Failure,
                        Some(TaskResult::failure(FailureReason::HandlerError, message)),
                    )?;
                    self.write(&span, TaskStatus::Started, &failed).await?;
                    self.ack(&handle).await;
                }
                Outcome::Panicked(message) => {
                    error!("handler panicked: {message}");
                    let failed = record.transition(
                        TaskStatus::Failure,
                        Some(TaskResult::failure(FailureReason::HandlerPanicked, message)),
                    )?;
                    self.write(&span, TaskStatus::Started, &failed).await?;
                    self.ack(&handle).await;
                }
            }

            Ok(())
        }
        .instrument(span.clone())
        .await
    }

    /// Run a handler on its own task so a panic is contained, bounded by
    /// the execution timeout. Heartbeats keep the delivery invisible
    /// meanwhile.
    async fn execute(&self, handle: &AckHandle, handler: Arc<dyn Handler>, args: Vec<Value>) -> Outcome {
        let timeout = self.config.execution_timeout;
        let mut task = tokio::spawn(async move { handler.execute(args).await });
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut heartbeat = self.config.visibility_extension.map(Heartbeat::new);

        loop {
            tokio::select! {
                joined = &mut task => {
                    return match joined {
                        Ok(Ok(value)) => Outcome::Success(value),
                        Ok(Err(HandlerError::Retriable(message))) => Outcome::Retriable(message),
                        Ok(Err(HandlerError::Fatal(message))) => Outcome::Fatal(message),
                        Err(join_error) if join_error.is_panic() => {
                            Outcome::Panicked(panic_message(join_error.into_panic()))
                        }
                        Err(join_error) => Outcome::Panicked(join_error.to_string()),
                    };
                }
                _ = &mut deadline => break,
                by = beat(&mut heartbeat) => self.extend(handle, by).await,
            }
        }

        task.abort();
        Outcome::Retriable(format!("execution timed out after {timeout:?}"))
    }

    async fn extend(&self, handle: &AckHandle, by: Duration) {
        match self.channel.extend(handle, by).await {
            Ok(()) => debug!(msg_id = handle.msg_id(), "visibility extended"),
            // The next heartbeat tries again.
            Err(e) => warn!(msg_id = handle.msg_id(), "could not extend visibility: {e}"),
        }
    }

    async fn write(&self, span: &Span, from: TaskStatus, record: &TaskRecord) -> Result<()> {
        self.store.put(record).await?;
        metrics::task_state_transitions().add(
            1,
            &[
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", record.status.to_string()),
            ],
        );
        record_state_transition(span, &from.to_string(), &record.status.to_string());
        Ok(())
    }

    /// Ack with backoff. A failed ack only means the envelope comes back,
    /// and the duplicate check in `process` absorbs that.
    async fn ack(&self, handle: &AckHandle) {
        let acked = retry_transient(&self.config.backoff, "ack", || self.channel.ack(handle)).await;
        log_settle_error("ack", handle, acked);
    }

    async fn nack(&self, handle: &AckHandle) {
        let nacked =
            retry_transient(&self.config.backoff, "nack", || self.channel.nack(handle, true)).await;
        log_settle_error("nack", handle, nacked);
    }
}

/// Visibility extension schedule for one running handler.
struct Heartbeat {
    ticks: tokio::time::Interval,
    by: Duration,
}

impl Heartbeat {
    fn new(by: Duration) -> Self {
        let period = (by / 3).max(Duration::from_millis(1));
        let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        Self { ticks, by }
    }
}

/// Resolves on the next heartbeat, or never if extension is off.
async fn beat(heartbeat: &mut Option<Heartbeat>) -> Duration {
    match heartbeat {
        Some(h) => {
            h.ticks.tick().await;
            h.by
        }
        None => std::future::pending().await,
    }
}

fn log_settle_error(operation: &str, handle: &AckHandle, result: Result<()>) {
    match result {
        Ok(()) => {}
        Err(Error::StaleDelivery(e)) => {
            warn!(operation, msg_id = handle.msg_id(), "delivery no longer held: {e}");
        }
        Err(e) => {
            warn!(operation, msg_id = handle.msg_id(), "settle failed, message will reappear: {e}");
        }
    }
}

/// Bring a record left at RETRY (worker died between the RETRY and
/// PENDING writes) back to PENDING so it can be claimed again.
fn requeued(record: TaskRecord) -> Result<TaskRecord> {
    if record.status == TaskStatus::Retry {
        record.transition(TaskStatus::Pending, None)
    } else {
        Ok(record)
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
