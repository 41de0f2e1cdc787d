use chrono::{DateTime, Utc};
use courier_common::{MessageId, Priority};
use serde::{Deserialize, Serialize};

use crate::Result;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// The job reference carried on the queue
///
/// Only the message ID travels; the pipeline loads everything else from the
/// message repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    pub message_id: MessageId,
}

impl JobEnvelope {
    #[must_use]
    pub const fn new(message_id: MessageId) -> Self {
        Self { message_id }
    }

    /// # Errors
    /// If serialisation fails
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// # Errors
    /// If the payload is not a JSON object with a valid `messageId`
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// A job ready to hand to a broker, with its message properties
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundJob {
    pub payload: Vec<u8>,
    /// Broker priority, 1 to 10
    pub priority: u8,
    /// Survives a broker restart
    pub persistent: bool,
    pub content_type: String,
    pub message_id: String,
    /// Publish time in seconds since the Unix epoch
    pub timestamp: u64,
}

impl OutboundJob {
    /// Build the durable JSON job for a message
    ///
    /// # Errors
    /// If the envelope cannot be encoded
    pub fn for_message(message_id: MessageId, priority: Priority, now: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            payload: JobEnvelope::new(message_id).encode()?,
            priority: priority.broker_priority(),
            persistent: true,
            content_type: JSON_CONTENT_TYPE.to_string(),
            message_id: message_id.to_string(),
            timestamp: u64::try_from(now.timestamp()).unwrap_or_default(),
        })
    }
}
