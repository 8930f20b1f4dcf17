//! # taskq-rs
//!
//! Broker-mediated task dispatch with at-least-once delivery.
//!
//! A [`dispatch::Dispatcher`] records a task as PENDING and hands its
//! envelope to a [`channel::Channel`]. A [`worker::WorkerPool`] consumes
//! envelopes, runs the handler registered for the task type, and writes the
//! outcome to a [`store::ResultStore`], where [`status::StatusQuery`] reads
//! it back by task id.
//!
//! Channels and stores come in two flavours: in-memory (tests, single
//! process) and Postgres, using pgmq as the broker.

pub mod backoff;
pub mod channel;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod model;
pub mod registry;
pub mod status;
pub mod store;
pub mod telemetry;
pub mod worker;
