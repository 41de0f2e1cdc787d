//! Delivery side of courier
//!
//! - [`intake`] stores a submitted message and enqueues its job
//! - [`consumer`] takes jobs off the main queue and settles them with the
//!   broker according to how the attempt went
//! - [`pipeline`] runs one attempt: suppression, rendering, sending, and
//!   the resulting status transition
//! - [`classifier`] decides whether a failed attempt is worth repeating
//!
//! Retry delays are not timed here. A retryable job is rejected into the
//! broker's TTL ladder and comes back on its own.

pub mod classifier;
pub mod consumer;
pub mod error;
pub mod intake;
pub mod pipeline;
pub mod provider;
pub mod render;

pub use classifier::{Classification, classify, classify_text};
pub use consumer::{Consumer, DRAIN_TIMEOUT, Settlement};
pub use error::{
    ConsumerError, InfrastructureError, IntakeError, ProcessingError, ProviderError, RenderError,
    RenderField,
};
pub use intake::{Acceptance, IntakeService, SendRequest};
pub use pipeline::{Outcome, Pipeline};
pub use provider::{
    EmailProvider, SendOptions, SendResult, SmtpConfig, SmtpCredentials, SmtpProvider, TlsMode,
};
pub use render::{RenderInput, Rendered, RendererConfig, TemplateRenderer};
