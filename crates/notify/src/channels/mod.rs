//! Notification channel implementations.

pub mod opsgenie;
pub mod slack;
pub mod twilio;

use async_trait::async_trait;
use tracing::debug;

use crate::error::ChannelError;
use crate::notice::AlertNotice;
use crate::Outcome;

/// Trait for notification channels (voice call, incident system, chat webhook).
///
/// Implementors only provide [`send`](Self::send); [`deliver`](Self::deliver)
/// normalizes its result into an [`Outcome`].
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Get the name of this channel.
    fn name(&self) -> &str;

    /// Perform one delivery attempt.
    async fn send(&self, alert: &AlertNotice) -> Result<(), ChannelError>;

    /// Attempt delivery and classify the result.
    async fn deliver(&self, alert: &AlertNotice) -> Outcome {
        match self.send(alert).await {
            Ok(()) => Outcome::Delivered,
            Err(e) => {
                let outcome = e.outcome();
                debug!(
                    channel = self.name(),
                    alert_id = %alert.id,
                    error = %e,
                    ?outcome,
                    "Delivery failed"
                );
                outcome
            }
        }
    }
}
