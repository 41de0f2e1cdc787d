//! Typed error handling for the delivery pipeline.
//!
//! Failures are split by who can act on them:
//! - [`ProcessingError`]: something about this message or its delivery
//!   attempt went wrong; the classifier decides retry or fail
//! - [`InfrastructureError`]: a repository or broker was unavailable; the
//!   job is requeued untouched
//! - [`ConsumerError`], [`IntakeError`]: what the consumer loop and the
//!   intake service report to their callers

use std::fmt;

use courier_common::MessageId;
use courier_queue::QueueError;
use courier_store::StoreError;
use thiserror::Error;

/// The message content a render failure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderField {
    Subject,
    HtmlBody,
    TextBody,
}

impl fmt::Display for RenderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Subject => "subject",
            Self::HtmlBody => "htmlBody",
            Self::TextBody => "textBody",
        })
    }
}

/// A template failed to compile or expand.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Failed to render {field}: {message}")]
pub struct RenderError {
    pub field: RenderField,
    pub message: String,
}

/// The email provider could not be built or raised an error while sending.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ProviderError(pub String);

/// A failure of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Rendering(#[from] RenderError),

    /// A `to` recipient is on the tenant's suppression list.
    #[error("Recipient {email} is on the suppression list")]
    SuppressedRecipient { email: String },

    /// The provider reported a failure or raised an error.
    #[error("{0}")]
    Provider(String),
}

impl From<ProviderError> for ProcessingError {
    fn from(value: ProviderError) -> Self {
        Self::Provider(value.0)
    }
}

/// A collaborator the pipeline depends on is unavailable.
#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Subscribing to or cancelling the main queue failed.
    #[error("Consumer queue error: {0}")]
    Queue(#[from] QueueError),
}

#[derive(Debug, Error)]
pub enum IntakeError {
    /// The request can never be accepted as given.
    #[error("Invalid request: {0}")]
    Invalid(String),

    /// No such message for this tenant.
    #[error("Message {0} not found")]
    NotFound(MessageId),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The message was stored but its job could not be enqueued.
    #[error("Failed to enqueue message {id}: {source}")]
    Publish {
        id: MessageId,
        #[source]
        source: QueueError,
    },
}

impl IntakeError {
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
