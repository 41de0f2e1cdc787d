//! Persistent data model shared by the store, queue and delivery crates

mod event;
mod ids;
mod message;
mod tenant;
mod view;

pub use event::{Event, EventType, NewEvent};
pub use ids::{MessageId, TenantId};
pub use message::{
    EmailAddress, Message, MessageStatus, NewMessage, Priority, Recipient, RecipientKind,
    StatusUpdate, Variables,
};
pub use tenant::{SuppressionEntry, Tenant, TenantRef};
pub use view::{Attachment, MessageView, ProcessingMessage};
