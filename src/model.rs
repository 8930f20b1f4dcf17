//! Core data model.
//!
//! A task envelope is what travels through the channel. A task record is
//! what the result store keeps about it: lifecycle status plus the final
//! result once the task is terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Task ID
// ---------------------------------------------------------------------------

/// Newtype for task identifiers. Random 128-bit, generated at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(TaskId)
            .map_err(|e| Error::Other(format!("invalid task id {s:?}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A unit of work as carried by the channel. Immutable once enqueued,
/// apart from `delivery_count`, which the channel stamps on each handout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: TaskId,

    /// Name resolved against the worker's handler registry (e.g. "add").
    pub task_type: String,

    /// Positional arguments. Opaque to everything but the handler.
    pub args: Vec<serde_json::Value>,

    pub enqueued_at: DateTime<Utc>,

    /// 0 on first delivery, +1 for every redelivery.
    #[serde(default)]
    pub delivery_count: u32,
}

impl TaskEnvelope {
    pub fn new(task_type: impl Into<String>, args: Vec<serde_json::Value>) -> Self {
        Self {
            task_id: TaskId::new(),
            task_type: task_type.into(),
            args,
            enqueued_at: Utc::now(),
            delivery_count: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Submitted (or re-queued), waiting for a worker.
    Pending,
    /// A worker has claimed it and is executing.
    Started,
    /// Done successfully. Terminal.
    Success,
    /// Failed permanently. Terminal.
    Failure,
    /// Retriable failure; about to go back to Pending.
    Retry,
}

impl TaskStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Started)
                | (Pending, Failure)    // enqueue rollback, unknown task type
                | (Started, Started)    // redelivered after visibility timeout
                | (Started, Success)
                | (Started, Failure)
                | (Started, Retry)
                | (Retry, Pending)
        )
    }

    /// Is this a terminal status?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Started => "STARTED",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
            TaskStatus::Retry => "RETRY",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "STARTED" => Ok(TaskStatus::Started),
            "SUCCESS" => Ok(TaskStatus::Success),
            "FAILURE" => Ok(TaskStatus::Failure),
            "RETRY" => Ok(TaskStatus::Retry),
            other => Err(Error::Other(format!("unknown task status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// Why a task ended in FAILURE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The record was written but the envelope never reached the broker.
    EnqueueFailed,
    UnknownTaskType,
    MaxRetriesExceeded,
    /// The handler signalled a non-retriable error.
    HandlerError,
    /// The handler panicked.
    HandlerPanicked,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureReason::EnqueueFailed => "enqueue_failed",
            FailureReason::UnknownTaskType => "unknown_task_type",
            FailureReason::MaxRetriesExceeded => "max_retries_exceeded",
            FailureReason::HandlerError => "handler_error",
            FailureReason::HandlerPanicked => "handler_panicked",
        };
        write!(f, "{s}")
    }
}

/// Error payload stored with a FAILURE record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub reason: FailureReason,
    pub message: String,
}

/// What a terminal task produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskResult {
    Value { value: serde_json::Value },
    Error(TaskFailure),
}

impl TaskResult {
    pub fn value(value: serde_json::Value) -> Self {
        TaskResult::Value { value }
    }

    pub fn failure(reason: FailureReason, message: impl Into<String>) -> Self {
        TaskResult::Error(TaskFailure {
            reason,
            message: message.into(),
        })
    }

    /// The failure reason, if this is an error result.
    pub fn reason(&self) -> Option<FailureReason> {
        match self {
            TaskResult::Value { .. } => None,
            TaskResult::Error(failure) => Some(failure.reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// The result store's view of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub task_type: String,
    pub status: TaskStatus,

    /// Present only when `status` is terminal.
    pub result: Option<TaskResult>,

    /// Number of retriable failures so far.
    pub retries: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// A fresh PENDING record for an envelope about to be enqueued.
    pub fn pending(envelope: &TaskEnvelope) -> Self {
        let now = Utc::now();
        Self {
            task_id: envelope.task_id,
            task_type: envelope.task_type.clone(),
            status: TaskStatus::Pending,
            result: None,
            retries: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a status transition, returning the updated record.
    ///
    /// A result is attached only on terminal transitions; any result
    /// passed for a non-terminal status is dropped.
    pub fn transition(mut self, to: TaskStatus, result: Option<TaskResult>) -> Result<Self> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }

        if to == TaskStatus::Retry {
            self.retries += 1;
        }

        // Strictly after the previous write so last-write-wins keeps
        // the newest transition even within one clock tick.
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + chrono::Duration::microseconds(1)
        };
        self.status = to;
        self.result = if to.is_terminal() { result } else { None };
        Ok(self)
    }
}
