use std::time::Duration;

use async_trait::async_trait;
use courier_common::EmailAddress;
use lettre::{
    Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
    message::{Mailbox, MultiPart, SinglePart},
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
    },
};
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::{
    error::ProviderError,
    provider::{EmailProvider, SendOptions, SendResult},
};

type Transport = AsyncSmtpTransport<Tokio1Executor>;

/// How the connection to the relay is secured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum TlsMode {
    /// Plain text only
    None,
    /// Upgrade with STARTTLS when the relay offers it
    #[default]
    Opportunistic,
    /// Require STARTTLS
    StartTls,
    /// TLS from the first byte (usually port 465)
    Wrapper,
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct SmtpCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for SmtpCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Relay settings
///
/// # Examples
///
/// ```ron
/// Courier (
///     smtp: (
///         host: "smtp.example.com",
///         port: 587,
///         tls: StartTls,
///         credentials: Some((username: "courier", password: "secret")),
///     ),
/// )
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: TlsMode,
    #[serde(default)]
    pub credentials: Option<SmtpCredentials>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Right-hand side of generated Message-IDs (defaults to `host`)
    #[serde(default)]
    pub message_id_domain: Option<String>,
}

fn default_host() -> String {
    "localhost".to_string()
}

const fn default_port() -> u16 {
    1025
}

const fn default_timeout_secs() -> u64 {
    30
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tls: TlsMode::default(),
            credentials: None,
            timeout_secs: default_timeout_secs(),
            message_id_domain: None,
        }
    }
}

/// Sends through an SMTP relay with lettre's pooled tokio transport
///
/// Every email gets a fresh `<ulid@domain>` Message-ID, which is reported
/// back as the provider message ID.
pub struct SmtpProvider {
    transport: Transport,
    domain: String,
}

impl std::fmt::Debug for SmtpProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpProvider")
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

impl SmtpProvider {
    /// Build the transport. No connection is made until the first send.
    ///
    /// # Errors
    /// If TLS parameters cannot be built for the configured host
    pub fn new(config: &SmtpConfig) -> Result<Self, ProviderError> {
        let tls = |host: &str| {
            TlsParameters::new(host.to_string()).map_err(|e| ProviderError(e.to_string()))
        };

        let builder = Transport::builder_dangerous(&config.host);
        let builder = match config.tls {
            TlsMode::None => builder.tls(Tls::None),
            TlsMode::Opportunistic => builder.tls(Tls::Opportunistic(tls(&config.host)?)),
            TlsMode::StartTls => builder.tls(Tls::Required(tls(&config.host)?)),
            TlsMode::Wrapper => builder.tls(Tls::Wrapper(tls(&config.host)?)),
        }
        .port(config.port)
        .timeout(Some(Duration::from_secs(config.timeout_secs)));

        let builder = match &config.credentials {
            Some(credentials) => builder.credentials(Credentials::new(
                credentials.username.clone(),
                credentials.password.clone(),
            )),
            None => builder,
        };

        Ok(Self {
            transport: builder.build(),
            domain: config
                .message_id_domain
                .clone()
                .unwrap_or_else(|| config.host.clone()),
        })
    }

    fn next_message_id(&self) -> String {
        format!("<{}@{}>", ulid::Ulid::new(), self.domain)
    }
}

fn mailbox(address: &EmailAddress) -> Result<Mailbox, lettre::address::AddressError> {
    Ok(Mailbox::new(
        address.name.clone(),
        address.email.parse::<Address>()?,
    ))
}

/// Assemble the MIME message.
///
/// Problems found here are reported in the words a relay would use to
/// reject them, so they classify the same way.
fn build_message(options: &SendOptions, message_id: &str) -> Result<lettre::Message, String> {
    let from = mailbox(&options.from)
        .map_err(|e| format!("553 invalid sender address {}: {e}", options.from.email))?;
    let recipient = |address: &EmailAddress| {
        mailbox(address).map_err(|e| format!("invalid recipient {}: {e}", address.email))
    };

    let mut builder = lettre::Message::builder()
        .from(from)
        .subject(options.subject.clone())
        .message_id(Some(message_id.to_string()));

    for address in &options.to {
        builder = builder.to(recipient(address)?);
    }
    for address in &options.cc {
        builder = builder.cc(recipient(address)?);
    }
    for address in &options.bcc {
        builder = builder.bcc(recipient(address)?);
    }

    match &options.text {
        Some(text) => builder.multipart(MultiPart::alternative_plain_html(
            text.clone(),
            options.html.clone(),
        )),
        None => builder.singlepart(SinglePart::html(options.html.clone())),
    }
    .map_err(|e| format!("554 message rejected: {e}"))
}

#[async_trait]
impl EmailProvider for SmtpProvider {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, options: SendOptions) -> Result<SendResult, ProviderError> {
        let message_id = self.next_message_id();

        let email = match build_message(&options, &message_id) {
            Ok(email) => email,
            Err(reason) => {
                warn!(%message_id, error = %reason, "Refusing to send malformed email");
                return Ok(SendResult::failed(reason));
            }
        };

        match self.transport.send(email).await {
            Ok(response) => {
                debug!(%message_id, code = %response.code(), "Email accepted by relay");
                Ok(SendResult::sent(Some(message_id)))
            }
            Err(e) => {
                error!(%message_id, error = %e, "SMTP send failed");
                Ok(SendResult::failed(e.to_string()))
            }
        }
    }

    async fn validate_connection(&self) -> bool {
        match self.transport.test_connection().await {
            Ok(reachable) => reachable,
            Err(e) => {
                warn!(error = %e, "SMTP relay unreachable");
                false
            }
        }
    }
}
