//! Escalation policy: what to do after an attempt finished.
//!
//! The policy is a pure function of the channel's position in the escalation
//! and the attempt outcome. It never sees acknowledgments; the engine handles
//! those before the policy is consulted.

use std::time::Duration;

use callout_notify::Outcome;
use serde::Serialize;

use crate::registry::Channel;

/// Where a channel stands when one of its attempts finished.
#[derive(Debug, Clone, Copy)]
pub struct EscalationState<'a> {
    pub channel: &'a Channel,
    /// Attempts made on this channel so far, including the one that finished
    pub attempts_on_channel: u32,
    /// Other channels of the current tier that are still running or waiting to retry
    pub channels_remaining_in_tier: usize,
    /// Tiers after the current one
    pub tiers_remaining: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Delivered,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    RetrySameChannel { after: Duration },
    AdvanceToNextChannel,
    AdvanceToNextTier,
    Stop(StopReason),
}

/// Decide the next step for a channel.
#[must_use]
pub fn next(state: &EscalationState<'_>, last: &Outcome) -> Action {
    match last {
        Outcome::Delivered => Action::Stop(StopReason::Delivered),
        Outcome::TransientFailure(_) if state.attempts_on_channel <= state.channel.max_retries => {
            Action::RetrySameChannel {
                after: state.channel.backoff.delay_for(state.attempts_on_channel),
            }
        }
        Outcome::TransientFailure(_) | Outcome::PermanentFailure(_) => advance(state),
    }
}

fn advance(state: &EscalationState<'_>) -> Action {
    if state.channels_remaining_in_tier > 0 {
        Action::AdvanceToNextChannel
    } else if state.tiers_remaining > 0 {
        Action::AdvanceToNextTier
    } else {
        Action::Stop(StopReason::Exhausted)
    }
}
