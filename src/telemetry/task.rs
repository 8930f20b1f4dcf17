//! Task execution span helpers.

use tracing::Span;

use crate::model::TaskEnvelope;

/// Span covering one delivery of a task, from routing to ack.
///
/// `task.status` starts empty and is filled by [`record_state_transition`].
pub fn start_task_span(envelope: &TaskEnvelope, worker: usize) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.id" = %envelope.task_id,
        "task.type" = %envelope.task_type,
        "task.delivery_count" = envelope.delivery_count,
        "worker.index" = worker,
        "task.status" = tracing::field::Empty,
    )
}

/// Emit a transition event inside `span` and record the new status on it.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("task.status", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
