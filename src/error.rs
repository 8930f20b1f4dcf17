//! Error types for taskq-rs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The broker could not accept a submission within the submit timeout.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The channel could not be reached for a read, ack, or enqueue.
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    /// An ack or nack arrived after the delivery's visibility window lapsed
    /// and the message was handed to another consumer.
    #[error("stale delivery: {0}")]
    StaleDelivery(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Broker and channel outages are worth retrying with backoff.
    /// Everything else is permanent from the caller's point of view.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::BrokerUnavailable(_) | Error::ChannelUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
