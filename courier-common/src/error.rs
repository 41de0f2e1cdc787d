//! Error types for the courier-common crate.

use thiserror::Error;

/// Errors raised while parsing model values from their wire representation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    /// The string is not a valid message identifier.
    #[error("Invalid message id: {0}")]
    InvalidMessageId(String),

    /// The string names no known message status.
    #[error("Unknown message status: {0}")]
    UnknownStatus(String),

    /// The string names no known priority.
    #[error("Unknown priority: {0}")]
    UnknownPriority(String),

    /// The string names no known recipient kind.
    #[error("Unknown recipient kind: {0}")]
    UnknownRecipientKind(String),
}
