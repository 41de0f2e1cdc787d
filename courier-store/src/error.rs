//! Error types for the courier-store crate.

use courier_common::{MessageId, MessageStatus, TenantId};
use thiserror::Error;

/// Top-level store error type.
///
/// Every repository operation returns this error. `Conflict` is not a
/// failure from the caller's point of view: it carries the message that
/// already owns the idempotency key so the caller can replay it.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No message with this ID (or not visible to this tenant).
    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    /// No tenant with this ID.
    #[error("Tenant not found: {0}")]
    TenantNotFound(TenantId),

    /// The tenant already has a message for this idempotency key.
    #[error("Idempotency key already used by message {existing}")]
    Conflict { existing: MessageId },

    /// The requested status change is not an edge of the status DAG.
    #[error("Invalid status transition for message {id}: {from} -> {to}")]
    InvalidTransition {
        id: MessageId,
        from: MessageStatus,
        to: MessageStatus,
    },

    /// The update would lower the attempt counter.
    #[error("Attempt count for message {id} cannot decrease from {current} to {requested}")]
    AttemptCountRegression {
        id: MessageId,
        current: u32,
        requested: u32,
    },

    /// The backing store refused to grow past its configured capacity.
    #[error("Store capacity exceeded: {0} messages")]
    CapacityExceeded(usize),

    /// The backing store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Internal error (lock poisoning, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::MessageNotFound(_) | Self::TenantNotFound(_))
    }

    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("Lock poisoned: {e}"))
    }
}
