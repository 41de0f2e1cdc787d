//! Outbound email transports
//!
//! The pipeline only sees [`EmailProvider`]; [`SmtpProvider`] is the one
//! implementation shipped.

pub mod smtp;

use async_trait::async_trait;
use courier_common::{EmailAddress, Message, RecipientKind};

use crate::{error::ProviderError, render::Rendered};

pub use smtp::{SmtpConfig, SmtpCredentials, SmtpProvider, TlsMode};

/// A fully rendered email, recipients partitioned by kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOptions {
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
}

impl SendOptions {
    /// Address a rendered message to its stored recipients
    #[must_use]
    pub fn new(message: &Message, rendered: Rendered) -> Self {
        let addresses = |kind: RecipientKind| -> Vec<EmailAddress> {
            message
                .recipients_of(kind)
                .map(|r| r.address.clone())
                .collect()
        };

        Self {
            from: message.from.clone(),
            to: addresses(RecipientKind::To),
            cc: addresses(RecipientKind::Cc),
            bcc: addresses(RecipientKind::Bcc),
            subject: rendered.subject,
            html: rendered.html,
            text: rendered.text,
        }
    }
}

/// What the provider reported for one send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub success: bool,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
}

impl SendResult {
    #[must_use]
    pub const fn sent(provider_message_id: Option<String>) -> Self {
        Self {
            success: true,
            provider_message_id,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            provider_message_id: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait EmailProvider: Send + Sync + std::fmt::Debug {
    /// Recorded on the message as `provider_name`
    fn name(&self) -> &str;

    /// Hand one email to the transport.
    ///
    /// A refusal can come back either as `SendResult { success: false, .. }`
    /// or as an error; the pipeline treats both the same way.
    ///
    /// # Errors
    /// If the transport failed while sending
    async fn send(&self, options: SendOptions) -> Result<SendResult, ProviderError>;

    /// Whether the transport is currently reachable
    async fn validate_connection(&self) -> bool;
}
