//! Shared building blocks for the courier delivery pipeline
//!
//! This crate holds the data model every other courier crate speaks
//! (messages, recipients, audit events, tenants, suppression entries) and
//! the logging setup used by the worker process.

pub mod error;
pub mod logging;
pub mod model;

pub use error::ModelError;
pub use model::{
    Attachment, EmailAddress, Event, EventType, Message, MessageId, MessageStatus, MessageView,
    NewEvent, NewMessage, Priority, ProcessingMessage, Recipient, RecipientKind, StatusUpdate,
    SuppressionEntry, Tenant, TenantId, TenantRef, Variables,
};
pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
