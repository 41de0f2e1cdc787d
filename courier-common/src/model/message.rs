use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    ModelError,
    model::{Attachment, MessageId, TenantId},
};

/// Opaque template variables supplied by the caller
pub type Variables = serde_json::Map<String, serde_json::Value>;

/// Delivery status of a message
///
/// Legal transitions form a small DAG:
///
/// ```text
/// queued ──► processing ──► sent
///    ▲            │    └──► failed
///    └────────────┘
/// ```
///
/// `Sent` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Queued,
    Processing,
    Sent,
    Failed,
}

impl MessageStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    /// Terminal statuses are never left once entered
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }

    /// Whether a record in this status may be updated to `next`.
    ///
    /// Staying in `Processing` is allowed so rendered content can be
    /// persisted mid-attempt.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Processing)
                | (
                    Self::Processing,
                    Self::Processing | Self::Sent | Self::Failed | Self::Queued
                )
        )
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(ModelError::UnknownStatus(other.to_string())),
        }
    }
}

/// Caller-requested delivery priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Numeric priority carried on the broker message
    #[must_use]
    pub const fn broker_priority(self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Normal => 5,
            Self::High => 8,
            Self::Critical => 10,
        }
    }

    /// Parse a priority name, treating anything unrecognised as `Normal`
    #[must_use]
    pub fn from_name_or_default(name: &str) -> Self {
        name.parse().unwrap_or_default()
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(ModelError::UnknownPriority(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientKind {
    To,
    Cc,
    Bcc,
}

impl FromStr for RecipientKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "to" => Ok(Self::To),
            "cc" => Ok(Self::Cc),
            "bcc" => Ok(Self::Bcc),
            other => Err(ModelError::UnknownRecipientKind(other.to_string())),
        }
    }
}

/// An email address with an optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl EmailAddress {
    #[must_use]
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
        }
    }

    #[must_use]
    pub fn named(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: Some(name.into()),
        }
    }
}

/// A recipient of a message; immutable once the message is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub kind: RecipientKind,
    #[serde(flatten)]
    pub address: EmailAddress,
}

impl Recipient {
    #[must_use]
    pub fn to(email: impl Into<String>) -> Self {
        Self::new(RecipientKind::To, email)
    }

    #[must_use]
    pub fn cc(email: impl Into<String>) -> Self {
        Self::new(RecipientKind::Cc, email)
    }

    #[must_use]
    pub fn bcc(email: impl Into<String>) -> Self {
        Self::new(RecipientKind::Bcc, email)
    }

    #[must_use]
    pub fn new(kind: RecipientKind, email: impl Into<String>) -> Self {
        Self {
            kind,
            address: EmailAddress::new(email),
        }
    }

    #[must_use]
    pub fn email(&self) -> &str {
        &self.address.email
    }
}

/// A stored message and its delivery bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub tenant_id: TenantId,
    pub idempotency_key: String,
    pub status: MessageStatus,
    pub priority: Priority,
    pub from: EmailAddress,
    pub subject: String,
    pub html_body: String,
    pub text_body: Option<String>,
    pub variables: Option<Variables>,
    pub recipients: Vec<Recipient>,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub provider_name: Option<String>,
    pub provider_message_id: Option<String>,
    pub rendered_subject: Option<String>,
    pub rendered_html: Option<String>,
    pub rendered_text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Materialise a freshly accepted message in `Queued` status
    #[must_use]
    pub fn from_new(id: MessageId, new: NewMessage, now: DateTime<Utc>) -> Self {
        Self {
            id,
            tenant_id: new.tenant_id,
            idempotency_key: new.idempotency_key,
            status: MessageStatus::Queued,
            priority: new.priority,
            from: new.from,
            subject: new.subject,
            html_body: new.html_body,
            text_body: new.text_body,
            variables: new.variables,
            recipients: new.recipients,
            attempt_count: 0,
            last_attempt_at: None,
            sent_at: None,
            failed_at: None,
            error_message: None,
            provider_name: None,
            provider_message_id: None,
            rendered_subject: None,
            rendered_html: None,
            rendered_text: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Recipients of the given kind, in creation order
    pub fn recipients_of(&self, kind: RecipientKind) -> impl Iterator<Item = &Recipient> {
        self.recipients.iter().filter(move |r| r.kind == kind)
    }

    /// Apply a partial update. Fields left as `None` are untouched.
    pub fn apply(&mut self, update: &StatusUpdate, now: DateTime<Utc>) {
        self.status = update.status;

        if let Some(count) = update.attempt_count {
            self.attempt_count = count;
        }

        macro_rules! assign {
            ($($field:ident),*) => {
                $(
                    if let Some(value) = &update.$field {
                        self.$field = Some(value.clone());
                    }
                )*
            };
        }

        assign!(
            last_attempt_at,
            sent_at,
            failed_at,
            error_message,
            provider_name,
            provider_message_id,
            rendered_subject,
            rendered_html,
            rendered_text
        );

        self.updated_at = now;
    }
}

/// Everything needed to create a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub tenant_id: TenantId,
    pub idempotency_key: String,
    #[serde(default)]
    pub priority: Priority,
    pub from: EmailAddress,
    pub subject: String,
    pub html_body: String,
    #[serde(default)]
    pub text_body: Option<String>,
    #[serde(default)]
    pub variables: Option<Variables>,
    pub recipients: Vec<Recipient>,
    /// Attachment metadata, stored beside the message rather than on it
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Partial update applied to a message together with its new status
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: MessageStatus,
    pub attempt_count: Option<u32>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub provider_name: Option<String>,
    pub provider_message_id: Option<String>,
    pub rendered_subject: Option<String>,
    pub rendered_html: Option<String>,
    pub rendered_text: Option<String>,
}

impl StatusUpdate {
    /// An update that only changes the status
    #[must_use]
    pub const fn to(status: MessageStatus) -> Self {
        Self {
            status,
            attempt_count: None,
            last_attempt_at: None,
            sent_at: None,
            failed_at: None,
            error_message: None,
            provider_name: None,
            provider_message_id: None,
            rendered_subject: None,
            rendered_html: None,
            rendered_text: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn new_message() -> NewMessage {
        NewMessage {
            tenant_id: TenantId::new("tenant-a"),
            idempotency_key: "key-1".to_string(),
            priority: Priority::High,
            from: EmailAddress::named("noreply@example.com", "Example"),
            subject: "Hi {{name}}".to_string(),
            html_body: "<p>Hi {{name}}</p>".to_string(),
            text_body: None,
            variables: None,
            recipients: vec![Recipient::to("a@x.com"), Recipient::cc("b@x.com")],
            attachments: Vec::new(),
        }
    }

    #[test]
    fn test_status_transitions() {
        use MessageStatus::{Failed, Processing, Queued, Sent};

        assert!(Queued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Sent));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Queued));
        assert!(Processing.can_transition_to(Processing));

        assert!(!Queued.can_transition_to(Sent));
        assert!(!Queued.can_transition_to(Queued));
        for terminal in [Sent, Failed] {
            assert!(terminal.is_terminal());
            for next in [Queued, Processing, Sent, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_broker_priority_mapping() {
        assert_eq!(Priority::Low.broker_priority(), 1);
        assert_eq!(Priority::Normal.broker_priority(), 5);
        assert_eq!(Priority::High.broker_priority(), 8);
        assert_eq!(Priority::Critical.broker_priority(), 10);
        assert_eq!(Priority::from_name_or_default("urgent").broker_priority(), 5);
        assert_eq!(Priority::from_name_or_default("critical"), Priority::Critical);
    }

    #[test]
    fn test_apply_leaves_unset_fields() {
        let now = Utc::now();
        let mut message = Message::from_new(MessageId::generate(), new_message(), now);
        message.apply(
            &StatusUpdate {
                attempt_count: Some(1),
                last_attempt_at: Some(now),
                ..StatusUpdate::to(MessageStatus::Processing)
            },
            now,
        );
        message.apply(
            &StatusUpdate {
                error_message: Some("421 try later".to_string()),
                ..StatusUpdate::to(MessageStatus::Queued)
            },
            now,
        );

        assert_eq!(message.status, MessageStatus::Queued);
        assert_eq!(message.attempt_count, 1);
        assert_eq!(message.last_attempt_at, Some(now));
        assert_eq!(message.error_message.as_deref(), Some("421 try later"));
        assert_eq!(message.sent_at, None);
    }

    #[test]
    fn test_recipients_of() {
        let message = Message::from_new(MessageId::generate(), new_message(), Utc::now());
        let to: Vec<_> = message
            .recipients_of(RecipientKind::To)
            .map(Recipient::email)
            .collect();
        assert_eq!(to, vec!["a@x.com"]);
        assert_eq!(message.recipients_of(RecipientKind::Bcc).count(), 0);
    }

    #[test]
    fn test_recipient_wire_format() {
        let recipient = Recipient {
            kind: RecipientKind::Bcc,
            address: EmailAddress::named("c@x.com", "C"),
        };
        let json = serde_json::to_value(&recipient).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({ "kind": "bcc", "email": "c@x.com", "name": "C" })
        );
    }
}
