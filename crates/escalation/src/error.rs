//! Escalation engine errors.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the escalation engine and channel registry.
///
/// Delivery failures never show up here; they are recorded as attempts and,
/// when everything fails, as the alert's `exhausted` state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EscalationError {
    #[error("alert {id} not found")]
    AlertNotFound { id: Uuid },

    #[error("escalation task for alert {id} stopped unexpectedly")]
    Abandoned { id: Uuid },

    #[error("channel {name} is registered twice")]
    DuplicateChannel { name: String },
}

pub type Result<T> = std::result::Result<T, EscalationError>;
