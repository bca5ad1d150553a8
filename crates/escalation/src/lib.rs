//! Alert escalation for the callout dispatcher.
//!
//! An incoming alert is pushed through the enabled notification channels
//! until one of them delivers, a human acknowledges the alert, or every
//! channel has failed:
//!
//! ```text
//! received -> escalating -> notified -> acknowledged
//!                  |                         ^
//!                  +--> exhausted            |
//!                  +-------------------------+
//! ```
//!
//! - [`registry`] holds the adapters, grouped into priority tiers
//! - [`policy`] decides between retry, fallback and stop after each attempt
//! - [`engine`] owns the per-alert state machine and the timing

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod engine;
pub mod error;
pub mod model;
pub mod policy;
pub mod registry;

pub use engine::{EngineSettings, EscalationEngine};
pub use error::{EscalationError, Result};
pub use model::{Alert, AlertState, AlertSummary, Attempt, AttemptOutcome};
pub use policy::{Action, EscalationState, StopReason};
pub use registry::{Backoff, Channel, ChannelRegistry};
