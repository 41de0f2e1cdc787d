use serde::{Deserialize, Serialize};

use crate::model::{Event, Message, TenantRef};

/// Attachment metadata; content lives in external object storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub storage_key: String,
}

/// Tenant-scoped view returned to status queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
    pub message: Message,
    /// Audit trail in creation order
    pub events: Vec<Event>,
}

/// View loaded by the processing pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMessage {
    pub message: Message,
    pub attachments: Vec<Attachment>,
    pub tenant: TenantRef,
}
