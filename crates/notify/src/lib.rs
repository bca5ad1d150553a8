//! Notification channel adapters for the callout escalation dispatcher.
//!
//! Every provider is wrapped behind the [`ChannelAdapter`] trait. An adapter
//! attempts exactly one delivery and reports an [`Outcome`]; retries,
//! ordering and fallback are decided by the escalation engine.
//!
//! # Channels
//!
//! - [`VoiceCallChannel`] triggers a Twilio Studio flow that rings the on-call person
//! - [`IncidentChannel`] files an alert in Opsgenie
//! - [`ChatWebhookChannel`] posts a message to a Slack webhook
//!
//! [`OnCallDirectory`] resolves the phone numbers of whoever is on call for an
//! Opsgenie schedule; the voice channel uses it when no numbers are supplied.
//!
//! # Outcome mapping
//!
//! A 2xx response is [`Outcome::Delivered`]. A 4xx response (bad request,
//! auth failure) is a [`Outcome::PermanentFailure`]. A 5xx response, a
//! connection error or a timeout is a [`Outcome::TransientFailure`].
//!
//! Deliveries are not idempotent. Retrying after a transient failure can ring
//! a phone twice or post a duplicate message when the first request reached
//! the provider but the answer got lost.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;
mod http;
pub mod notice;

pub use channels::opsgenie::{IncidentChannel, OnCallDirectory, ScheduleRef};
pub use channels::slack::ChatWebhookChannel;
pub use channels::twilio::VoiceCallChannel;
pub use channels::ChannelAdapter;
pub use error::ChannelError;
pub use notice::{AlertNotice, Payload, Severity};

use serde::{Deserialize, Serialize};

/// Reason reported when a delivery exceeds its time limit.
pub const TIMEOUT_REASON: &str = "timeout";

/// Result of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    /// The provider accepted the notification.
    Delivered,
    /// Delivery failed but may succeed when retried.
    TransientFailure(String),
    /// Delivery failed and retrying will not help.
    PermanentFailure(String),
}
