//! Decides whether a failed delivery attempt is worth repeating

use std::fmt;

use serde::Serialize;
use tracing::warn;

use crate::error::ProcessingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    /// Retry after the broker's delay
    Transient,
    /// Never retry
    Permanent,
}

impl Classification {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SMTP 5xx replies and their usual wording
const PERMANENT_MARKERS: &[&str] = &[
    "550",
    "551",
    "552",
    "553",
    "554",
    "invalid recipient",
    "user unknown",
    "mailbox not found",
    "relay denied",
];

/// Network faults, SMTP 4xx replies and throttling
const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "etimedout",
    "econnrefused",
    "econnreset",
    "enotfound",
    "connection",
    "dns",
    "421",
    "450",
    "451",
    "452",
    "rate limit",
    "too many",
];

/// Classify a failed attempt. The first matching rule wins:
///
/// 1. render failures and suppressed recipients are permanent, whatever
///    their text says
/// 2. text carrying a permanent marker is permanent
/// 3. text carrying a transient marker is transient
/// 4. anything else is transient, and logged so the gap can be closed
#[must_use]
pub fn classify(error: &ProcessingError) -> Classification {
    match error {
        ProcessingError::Rendering(_) | ProcessingError::SuppressedRecipient { .. } => {
            Classification::Permanent
        }
        ProcessingError::Provider(text) => classify_text(text),
    }
}

/// Rules 2 to 4 of [`classify`] applied to bare failure text
#[must_use]
pub fn classify_text(text: &str) -> Classification {
    let text = text.to_lowercase();

    if PERMANENT_MARKERS.iter().any(|marker| text.contains(marker)) {
        return Classification::Permanent;
    }

    if TRANSIENT_MARKERS.iter().any(|marker| text.contains(marker)) {
        return Classification::Transient;
    }

    warn!(error = %text, "Unrecognised failure classified as transient");
    Classification::Transient
}
