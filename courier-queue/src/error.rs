//! Error types for the courier-queue crate.

use thiserror::Error;

/// Broker and publishing errors.
///
/// Any of these escaping the pipeline is an infrastructure fault: the job is
/// requeued immediately rather than classified.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The AMQP client reported an error.
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// The broker answered a publish with a negative confirm.
    #[error("Broker rejected publish of message {message_id}")]
    Nacked { message_id: String },

    /// Publishing targeted an exchange that was never declared.
    #[error("Unknown exchange: {0}")]
    UnknownExchange(String),

    /// Subscribing targeted a queue that was never declared.
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    /// A job envelope could not be encoded or decoded.
    #[error("Invalid job envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    /// The topology configuration cannot work.
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    /// The broker connection is gone.
    #[error("Broker connection closed")]
    Closed,

    /// Internal error (lock poisoning, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Whether the broker refused the message rather than failing to talk.
    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::Nacked { .. })
    }
}

/// Specialized `Result` type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

impl<T> From<std::sync::PoisonError<T>> for QueueError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("Lock poisoned: {e}"))
    }
}
