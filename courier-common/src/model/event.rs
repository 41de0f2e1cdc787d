use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::model::{MessageId, Priority, TenantId};

/// Kind of an audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "message.queued")]
    Queued,
    #[serde(rename = "message.processing")]
    Processing,
    #[serde(rename = "message.sent")]
    Sent,
    #[serde(rename = "message.failed")]
    Failed,
    #[serde(rename = "message.retrying")]
    Retrying,
}

impl EventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "message.queued",
            Self::Processing => "message.processing",
            Self::Sent => "message.sent",
            Self::Failed => "message.failed",
            Self::Retrying => "message.retrying",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An append-only audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number assigned by the store
    pub sequence: u64,
    pub message_id: MessageId,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// An event waiting to be appended
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: EventType,
    pub payload: serde_json::Value,
}

impl NewEvent {
    #[must_use]
    pub const fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            payload,
        }
    }

    #[must_use]
    pub fn queued(tenant_id: &TenantId, priority: Priority) -> Self {
        Self::new(
            EventType::Queued,
            json!({ "tenantId": tenant_id, "priority": priority }),
        )
    }

    #[must_use]
    pub fn processing(attempt: u32) -> Self {
        Self::new(EventType::Processing, json!({ "attempt": attempt }))
    }

    #[must_use]
    pub fn sent(provider: &str, provider_message_id: Option<&str>) -> Self {
        Self::new(
            EventType::Sent,
            json!({ "provider": provider, "providerMsgId": provider_message_id }),
        )
    }

    #[must_use]
    pub fn failed(error: &str) -> Self {
        Self::new(
            EventType::Failed,
            json!({ "error": error, "classification": "permanent" }),
        )
    }

    #[must_use]
    pub fn retrying(error: &str, attempt: u32) -> Self {
        Self::new(
            EventType::Retrying,
            json!({ "error": error, "classification": "transient", "attempt": attempt }),
        )
    }
}
