//! Metric instruments for taskq-rs.
//!
//! Built from the globally-registered `MeterProvider`, so they are no-ops
//! until [`super::init_telemetry`] installs an OTLP pipeline.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("taskq-rs")
}

/// Counter: tasks submitted.
/// Labels: `task_type`, `result` ("ok" | "enqueue_failed").
pub fn tasks_submitted() -> Counter<u64> {
    meter()
        .u64_counter("taskq.tasks.submitted")
        .with_description("Number of tasks submitted")
        .build()
}

/// Counter: task record status transitions.
/// Labels: `from`, `to`.
pub fn task_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("taskq.tasks.state_transitions")
        .with_description("Number of task status transitions")
        .build()
}

/// Counter: channel operations (create, send, read, ack, ...).
/// Labels: `queue`, `operation`.
pub fn channel_operations() -> Counter<u64> {
    meter()
        .u64_counter("taskq.channel.operations")
        .with_description("Number of channel operations")
        .build()
}

/// Histogram: handler execution time in milliseconds.
/// Labels: `task_type`, `outcome`.
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("taskq.tasks.duration_ms")
        .with_description("Task handler execution time")
        .with_unit("ms")
        .build()
}

/// Counter: deliveries whose task type has no registered handler.
/// Labels: `task_type`.
pub fn tasks_unroutable() -> Counter<u64> {
    meter()
        .u64_counter("taskq.tasks.unroutable")
        .with_description("Deliveries with no registered handler")
        .build()
}
