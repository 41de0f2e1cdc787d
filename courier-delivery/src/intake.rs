//! Accepting messages for delivery and reporting on them
//!
//! Acceptance is decoupled from delivery: [`IntakeService::submit`] returns
//! as soon as the message is stored and its job is on the queue, and
//! callers poll [`IntakeService::status`] for the outcome.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use courier_common::{
    Attachment, EmailAddress, Message, MessageId, MessageStatus, MessageView, NewEvent,
    NewMessage, Priority, Recipient, RecipientKind, TenantId, Variables,
};
use courier_queue::Publisher;
use courier_store::{MessageFilter, MessageRepository, Page, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::IntakeError;

const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;
const MAX_SUBJECT_LEN: usize = 998;
const MAX_NAME_LEN: usize = 255;

/// A caller's request to send one email
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub idempotency_key: String,
    #[serde(default, deserialize_with = "lenient_priority")]
    pub priority: Option<Priority>,
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    #[serde(default)]
    pub cc: Vec<EmailAddress>,
    #[serde(default)]
    pub bcc: Vec<EmailAddress>,
    pub subject: String,
    pub html_body: String,
    #[serde(default)]
    pub text_body: Option<String>,
    #[serde(default)]
    pub variables: Option<Variables>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Unrecognised priority names are delivered at normal priority
fn lenient_priority<'de, D>(deserializer: D) -> Result<Option<Priority>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?
        .map(|name| Priority::from_name_or_default(&name)))
}

impl SendRequest {
    fn validate(&self) -> Result<(), IntakeError> {
        let invalid = |reason: String| Err(IntakeError::Invalid(reason));

        if self.idempotency_key.trim().is_empty() {
            return invalid("idempotencyKey must not be empty".to_string());
        }
        if self.idempotency_key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return invalid(format!(
                "idempotencyKey must be at most {MAX_IDEMPOTENCY_KEY_LEN} characters"
            ));
        }
        if self.subject.trim().is_empty() {
            return invalid("subject must not be empty".to_string());
        }
        if self.subject.chars().count() > MAX_SUBJECT_LEN {
            return invalid(format!("subject must be at most {MAX_SUBJECT_LEN} characters"));
        }
        if self.html_body.trim().is_empty() {
            return invalid("htmlBody must not be empty".to_string());
        }
        if self.to.is_empty() {
            return invalid("at least one to recipient is required".to_string());
        }

        std::iter::once(("from", &self.from))
            .chain(self.to.iter().map(|a| ("to", a)))
            .chain(self.cc.iter().map(|a| ("cc", a)))
            .chain(self.bcc.iter().map(|a| ("bcc", a)))
            .try_for_each(|(field, address)| {
                if !is_plausible_email(&address.email) {
                    return invalid(format!("{field} has an invalid email: {}", address.email));
                }
                if address
                    .name
                    .as_ref()
                    .is_some_and(|name| name.chars().count() > MAX_NAME_LEN)
                {
                    return invalid(format!("{field} name must be at most {MAX_NAME_LEN} characters"));
                }
                Ok(())
            })
    }

    fn into_new_message(self, tenant_id: &TenantId) -> NewMessage {
        let recipients = [
            (RecipientKind::To, self.to),
            (RecipientKind::Cc, self.cc),
            (RecipientKind::Bcc, self.bcc),
        ]
        .into_iter()
        .flat_map(|(kind, addresses)| {
            addresses
                .into_iter()
                .map(move |address| Recipient { kind, address })
        })
        .collect();

        NewMessage {
            tenant_id: tenant_id.clone(),
            idempotency_key: self.idempotency_key,
            priority: self.priority.unwrap_or_default(),
            from: self.from,
            subject: self.subject,
            html_body: self.html_body,
            text_body: self.text_body,
            variables: self.variables,
            recipients,
            attachments: self.attachments,
        }
    }
}

/// `local@domain`, both parts present and no whitespace. The relay has the
/// final word on deliverability.
fn is_plausible_email(email: &str) -> bool {
    email
        .split_once('@')
        .is_some_and(|(local, domain)| {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !email.chars().any(char::is_whitespace)
        })
}

/// The answer to a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Acceptance {
    pub id: MessageId,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    /// `false` when the idempotency key was already used and the existing
    /// message is being returned
    #[serde(skip)]
    pub created: bool,
}

impl Acceptance {
    fn of(message: &Message, created: bool) -> Self {
        Self {
            id: message.id,
            status: message.status,
            created_at: message.created_at,
            created,
        }
    }

    /// HTTP-style status for the submission: 202 for a new message, 200
    /// for a replay
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        if self.created { 202 } else { 200 }
    }
}

#[derive(Debug, Clone)]
pub struct IntakeService {
    messages: Arc<dyn MessageRepository>,
    publisher: Publisher,
}

impl IntakeService {
    #[must_use]
    pub fn new(messages: Arc<dyn MessageRepository>, publisher: Publisher) -> Self {
        Self {
            messages,
            publisher,
        }
    }

    /// Store a message and enqueue its delivery.
    ///
    /// A repeated idempotency key returns the message created the first
    /// time and enqueues nothing.
    ///
    /// # Errors
    /// `Invalid` if the request is malformed, `Store` if the message cannot
    /// be stored, `Publish` if it was stored but the job could not be
    /// enqueued (the message stays `queued`).
    #[tracing::instrument(skip(self, request), fields(tenant = %tenant_id, key = %request.idempotency_key))]
    pub async fn submit(
        &self,
        tenant_id: &TenantId,
        request: SendRequest,
    ) -> Result<Acceptance, IntakeError> {
        request.validate()?;

        if let Some(existing) = self
            .messages
            .find_by_idempotency_key(tenant_id, &request.idempotency_key)
            .await?
        {
            debug!(message_id = %existing.id, "Idempotent replay");
            return Ok(Acceptance::of(&existing, false));
        }

        let priority = request.priority.unwrap_or_default();
        let key = request.idempotency_key.clone();
        let message = match self
            .messages
            .create(
                request.into_new_message(tenant_id),
                NewEvent::queued(tenant_id, priority),
            )
            .await
        {
            Ok(message) => message,
            // Lost a race with a concurrent submission of the same key
            Err(StoreError::Conflict { existing }) => {
                debug!(message_id = %existing, "Idempotent replay after conflict");
                let existing = self
                    .messages
                    .find_by_idempotency_key(tenant_id, &key)
                    .await?
                    .ok_or(StoreError::MessageNotFound(existing))?;
                return Ok(Acceptance::of(&existing, false));
            }
            Err(e) => return Err(e.into()),
        };

        self.publisher
            .publish(message.id, priority)
            .await
            .map_err(|source| IntakeError::Publish {
                id: message.id,
                source,
            })?;

        info!(message_id = %message.id, %priority, "Message queued for delivery");
        Ok(Acceptance::of(&message, true))
    }

    /// The message with its recipients and audit trail.
    ///
    /// # Errors
    /// `NotFound` if the tenant has no such message
    pub async fn status(
        &self,
        tenant_id: &TenantId,
        id: &MessageId,
    ) -> Result<MessageView, IntakeError> {
        self.messages
            .find_by_id(id, tenant_id)
            .await?
            .ok_or(IntakeError::NotFound(*id))
    }

    /// A page of the tenant's messages, newest first.
    ///
    /// # Errors
    /// If the store cannot be read
    pub async fn list(
        &self,
        tenant_id: &TenantId,
        filter: MessageFilter,
    ) -> Result<Page<Message>, IntakeError> {
        Ok(self.messages.find_many(tenant_id, filter).await?)
    }
}
