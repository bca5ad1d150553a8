//! Error types for notification delivery.

use reqwest::StatusCode;
use thiserror::Error;

use crate::Outcome;

/// Errors that can occur when delivering a notification.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// HTTP request failed before a response arrived
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider answered with a non-success status
    #[error("http response {status} for {url} with response body {body:?}")]
    Status {
        status: StatusCode,
        url: String,
        body: String,
    },

    /// Rate limited by the service
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Endpoint could not be built from the configured base URL
    #[error("Invalid endpoint url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Nobody to notify
    #[error("No recipients: {0}")]
    NoRecipients(String),
}

impl ChannelError {
    /// Whether retrying the same delivery can succeed.
    ///
    /// Timeouts, connection problems, 5xx and rate limiting are transient.
    /// Client errors (4xx), broken requests and missing recipients are not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => !e.is_builder(),
            Self::Status { status, .. } => status.is_server_error(),
            Self::RateLimited { .. } => true,
            Self::InvalidUrl(_) | Self::NoRecipients(_) => false,
        }
    }

    /// Normalize into a delivery outcome.
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        if let Self::Http(e) = self {
            if e.is_timeout() {
                return Outcome::TransientFailure(crate::TIMEOUT_REASON.to_string());
            }
        }

        if self.is_transient() {
            Outcome::TransientFailure(self.to_string())
        } else {
            Outcome::PermanentFailure(self.to_string())
        }
    }
}
