//! Alert lifecycle types.
//!
//! An [`Alert`] is created by the engine on receipt and only ever mutated by
//! the escalation task that owns it. Everything else sees cloned snapshots.

use std::fmt;
use std::sync::Arc;

use callout_notify::{AlertNotice, Outcome, Payload, TIMEOUT_REASON};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

/// Lifecycle state of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    /// Created, no attempt issued yet
    Received,
    /// Attempts are running or scheduled
    Escalating,
    /// A channel delivered, waiting for a human to acknowledge
    Notified,
    /// A human acknowledged the alert
    Acknowledged,
    /// Every enabled channel failed
    Exhausted,
}

impl AlertState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Acknowledged | Self::Exhausted)
    }

    /// No further attempts will be issued on the engine's own initiative.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Notified | Self::Acknowledged | Self::Exhausted)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Escalating => "escalating",
            Self::Notified => "notified",
            Self::Acknowledged => "acknowledged",
            Self::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one attempt as recorded in the attempt log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Delivered,
    TransientFailure { reason: String },
    PermanentFailure { reason: String },
    /// The adapter did not answer within the attempt timeout
    TimedOut,
}

impl AttemptOutcome {
    /// The outcome the escalation policy works with.
    #[must_use]
    pub fn as_outcome(&self) -> Outcome {
        match self {
            Self::Delivered => Outcome::Delivered,
            Self::TransientFailure { reason } => Outcome::TransientFailure(reason.clone()),
            Self::PermanentFailure { reason } => Outcome::PermanentFailure(reason.clone()),
            Self::TimedOut => Outcome::TransientFailure(TIMEOUT_REASON.to_string()),
        }
    }
}

impl From<Outcome> for AttemptOutcome {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Delivered => Self::Delivered,
            Outcome::TransientFailure(reason) if reason == TIMEOUT_REASON => Self::TimedOut,
            Outcome::TransientFailure(reason) => Self::TransientFailure { reason },
            Outcome::PermanentFailure(reason) => Self::PermanentFailure { reason },
        }
    }
}

/// One delivery attempt. Never changed once appended to the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    pub channel: String,
    /// 1-based attempt number on this channel
    pub sequence: u32,
    pub tier: u32,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub outcome: AttemptOutcome,
    /// Finished after the alert was acknowledged; kept for audit only
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub ignored: bool,
}

/// An alert tracked by the escalation engine.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Uuid,
    #[serde(serialize_with = "serialize_payload")]
    pub payload: Arc<Payload>,
    pub received_at: DateTime<Utc>,
    pub state: AlertState,
    pub attempts: Vec<Attempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// When the alert last reached a settled state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<DateTime<Utc>>,
    /// Attempts currently waiting for an adapter
    pub in_flight: usize,
}

impl Alert {
    #[must_use]
    pub fn new(id: Uuid, payload: Payload, received_at: DateTime<Utc>) -> Self {
        Self {
            id,
            payload: Arc::new(payload),
            received_at,
            state: AlertState::Received,
            attempts: Vec::new(),
            acknowledged_at: None,
            settled_at: None,
            in_flight: 0,
        }
    }

    /// Read-only view handed to channel adapters.
    #[must_use]
    pub fn notice(&self) -> AlertNotice {
        AlertNotice::new(self.id, self.received_at, Arc::clone(&self.payload))
    }

    /// Settled with no adapter call outstanding.
    #[must_use]
    pub const fn is_quiescent(&self) -> bool {
        self.state.is_settled() && self.in_flight == 0
    }

    /// Attempts recorded for one channel, in order.
    pub fn attempts_on<'a>(&'a self, channel: &'a str) -> impl Iterator<Item = &'a Attempt> + 'a {
        self.attempts.iter().filter(move |a| a.channel == channel)
    }

    #[must_use]
    pub fn summary(&self) -> AlertSummary {
        AlertSummary {
            id: self.id,
            state: self.state,
            received_at: self.received_at,
            attempts: self.attempts.len(),
            last_channel: self.attempts.last().map(|a| a.channel.clone()),
        }
    }
}

fn serialize_payload<S: Serializer>(payload: &Arc<Payload>, serializer: S) -> Result<S::Ok, S::Error> {
    payload.as_ref().serialize(serializer)
}

/// Compact listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertSummary {
    pub id: Uuid,
    pub state: AlertState,
    pub received_at: DateTime<Utc>,
    pub attempts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_channel: Option<String>,
}
