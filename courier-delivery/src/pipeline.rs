//! One delivery attempt for one message
//!
//! ```text
//! load ──► terminal? ──yes──► done (no side effects)
//!            │ no
//!            ▼
//!        processing (attempt + 1, event)
//!            │
//!  suppression ─► render ─► persist rendered ─► send
//!            │                                    │
//!            └──── failure ──► classify           ├──► sent (event)
//!                                 │               │
//!                       permanent ├──► failed (event)
//!                       transient └──► queued (retrying event)
//! ```
//!
//! Every status change goes through [`MessageRepository::transition`], so
//! the audit event is stored together with the status it describes.

use std::sync::Arc;

use chrono::Utc;
use courier_common::{
    Message, MessageId, MessageStatus, NewEvent, RecipientKind, StatusUpdate,
};
use courier_store::{MessageRepository, StoreError, Stores, SuppressionRepository};
use tracing::{debug, error, info, warn};

use crate::{
    classifier::{Classification, classify},
    error::{InfrastructureError, ProcessingError},
    provider::{EmailProvider, SendOptions},
    render::{RenderInput, TemplateRenderer},
};

/// How a single run of the pipeline ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The provider accepted the email.
    Sent { provider_message_id: Option<String> },
    /// The message had already reached a terminal status. Nothing was done.
    AlreadyFinal(MessageStatus),
    /// No message with this ID exists.
    Missing,
    /// Permanent failure, recorded on the message.
    Failed { error: String },
    /// Transient failure; the message is back in `queued`.
    Retry { error: String },
}

impl Outcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Sent { .. } | Self::AlreadyFinal(_))
    }

    /// Whether the job should go through the retry ladder
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}

/// Why an attempt stopped before the provider accepted the email
enum Failure {
    Processing(ProcessingError),
    Infrastructure(InfrastructureError),
}

impl From<ProcessingError> for Failure {
    fn from(value: ProcessingError) -> Self {
        Self::Processing(value)
    }
}

impl From<StoreError> for Failure {
    fn from(value: StoreError) -> Self {
        Self::Infrastructure(value.into())
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    messages: Arc<dyn MessageRepository>,
    suppressions: Arc<dyn SuppressionRepository>,
    renderer: Arc<TemplateRenderer>,
    provider: Arc<dyn EmailProvider>,
}

impl Pipeline {
    #[must_use]
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        suppressions: Arc<dyn SuppressionRepository>,
        renderer: Arc<TemplateRenderer>,
        provider: Arc<dyn EmailProvider>,
    ) -> Self {
        Self {
            messages,
            suppressions,
            renderer,
            provider,
        }
    }

    #[must_use]
    pub fn from_stores(
        stores: &Stores,
        renderer: Arc<TemplateRenderer>,
        provider: Arc<dyn EmailProvider>,
    ) -> Self {
        Self::new(
            stores.messages.clone(),
            stores.suppressions.clone(),
            renderer,
            provider,
        )
    }

    /// Run one delivery attempt for `id`.
    ///
    /// Failures of the attempt itself are recorded on the message and
    /// reported through the [`Outcome`].
    ///
    /// # Errors
    /// If a repository is unavailable. Nothing about the failure is
    /// recorded; the caller should hand the job back to the broker as is.
    #[tracing::instrument(skip(self), fields(message_id = %id))]
    pub async fn process(&self, id: &MessageId) -> Result<Outcome, InfrastructureError> {
        let Some(loaded) = self.messages.find_by_id_internal(id).await? else {
            error!("Message not found");
            return Ok(Outcome::Missing);
        };

        if loaded.message.status.is_terminal() {
            debug!(status = %loaded.message.status, "Message already final, skipping");
            return Ok(Outcome::AlreadyFinal(loaded.message.status));
        }

        let attempt = loaded.message.attempt_count + 1;
        let message = self
            .messages
            .transition(
                id,
                StatusUpdate {
                    attempt_count: Some(attempt),
                    last_attempt_at: Some(Utc::now()),
                    ..StatusUpdate::to(MessageStatus::Processing)
                },
                NewEvent::processing(attempt),
            )
            .await?;

        debug!(attempt, tenant = %loaded.tenant.name, "Processing message");

        match self.attempt(&message).await {
            Ok(provider_message_id) => self.record_sent(id, provider_message_id).await,
            Err(Failure::Processing(failure)) => self.record_failure(id, attempt, &failure).await,
            Err(Failure::Infrastructure(e)) => Err(e),
        }
    }

    /// Suppression, rendering and the send itself
    async fn attempt(&self, message: &Message) -> Result<Option<String>, Failure> {
        for recipient in message.recipients_of(RecipientKind::To) {
            if self
                .suppressions
                .is_suppressed(&message.tenant_id, recipient.email())
                .await?
            {
                return Err(ProcessingError::SuppressedRecipient {
                    email: recipient.email().to_string(),
                }
                .into());
            }
        }

        let rendered = self
            .renderer
            .render(
                RenderInput {
                    subject: &message.subject,
                    html_body: &message.html_body,
                    text_body: message.text_body.as_deref(),
                },
                message.variables.as_ref(),
            )
            .map_err(ProcessingError::from)?;

        self.messages
            .update_status(
                &message.id,
                StatusUpdate {
                    rendered_subject: Some(rendered.subject.clone()),
                    rendered_html: Some(rendered.html.clone()),
                    rendered_text: rendered.text.clone(),
                    ..StatusUpdate::to(MessageStatus::Processing)
                },
            )
            .await?;

        let result = self
            .provider
            .send(SendOptions::new(message, rendered))
            .await
            .map_err(ProcessingError::from)?;

        if result.success {
            Ok(result.provider_message_id)
        } else {
            Err(ProcessingError::Provider(
                result
                    .error
                    .unwrap_or_else(|| "Provider reported failure without a reason".to_string()),
            )
            .into())
        }
    }

    async fn record_sent(
        &self,
        id: &MessageId,
        provider_message_id: Option<String>,
    ) -> Result<Outcome, InfrastructureError> {
        let provider = self.provider.name();

        self.messages
            .transition(
                id,
                StatusUpdate {
                    sent_at: Some(Utc::now()),
                    provider_name: Some(provider.to_string()),
                    provider_message_id: provider_message_id.clone(),
                    ..StatusUpdate::to(MessageStatus::Sent)
                },
                NewEvent::sent(provider, provider_message_id.as_deref()),
            )
            .await?;

        info!(provider, ?provider_message_id, "Message sent");
        Ok(Outcome::Sent {
            provider_message_id,
        })
    }

    async fn record_failure(
        &self,
        id: &MessageId,
        attempt: u32,
        failure: &ProcessingError,
    ) -> Result<Outcome, InfrastructureError> {
        let error = failure.to_string();
        let classification = classify(failure);

        match classification {
            Classification::Permanent => {
                self.messages
                    .transition(
                        id,
                        StatusUpdate {
                            failed_at: Some(Utc::now()),
                            error_message: Some(error.clone()),
                            ..StatusUpdate::to(MessageStatus::Failed)
                        },
                        NewEvent::failed(&error),
                    )
                    .await?;

                error!(attempt, %classification, %error, "Message failed");
                Ok(Outcome::Failed { error })
            }
            Classification::Transient => {
                self.messages
                    .transition(
                        id,
                        StatusUpdate {
                            error_message: Some(error.clone()),
                            ..StatusUpdate::to(MessageStatus::Queued)
                        },
                        NewEvent::retrying(&error, attempt),
                    )
                    .await?;

                warn!(attempt, %classification, %error, "Message will be retried");
                Ok(Outcome::Retry { error })
            }
        }
    }
}
