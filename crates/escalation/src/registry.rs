//! Channel registry: the configured adapters and their escalation settings.

use std::sync::Arc;
use std::time::Duration;

use callout_config::{ChannelKind, ChannelTuning, DispatcherConfig};
use callout_notify::{
    ChannelAdapter, ChatWebhookChannel, IncidentChannel, OnCallDirectory, VoiceCallChannel,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{EscalationError, Result};

/// Exponential retry delay: `base * 2^(retry - 1)`, never above `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Backoff {
    #[serde(with = "millis")]
    pub base: Duration,
    #[serde(with = "millis")]
    pub cap: Duration,
}

impl Backoff {
    #[must_use]
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base
            .checked_mul(1_u32 << exponent)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(60))
    }
}

/// Escalation settings of one notification channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Channel {
    pub name: String,
    /// Lower tiers are attempted first
    pub tier: u32,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub backoff: Backoff,
    pub enabled: bool,
}

impl Channel {
    #[must_use]
    pub fn new(name: impl Into<String>, tier: u32) -> Self {
        Self {
            name: name.into(),
            tier,
            max_retries: 0,
            backoff: Backoff::default(),
            enabled: true,
        }
    }

    #[must_use]
    pub const fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub const fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff = Backoff::new(base, cap);
        self
    }

    #[must_use]
    pub const fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    #[must_use]
    pub fn from_tuning(kind: ChannelKind, tuning: ChannelTuning) -> Self {
        Self {
            name: kind.name().to_string(),
            tier: tuning.tier,
            max_retries: tuning.max_retries,
            backoff: Backoff::new(tuning.backoff_base, tuning.backoff_cap),
            enabled: tuning.enabled,
        }
    }
}

struct Registered {
    channel: Channel,
    adapter: Arc<dyn ChannelAdapter>,
}

/// Enabled channels sorted by tier. Within a tier, registration order is kept.
#[derive(Default)]
pub struct ChannelRegistry {
    entries: Vec<Registered>,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the adapters for every enabled channel in the configuration.
    pub fn from_config(config: &DispatcherConfig, client: &reqwest::Client) -> Result<Self> {
        let mut registry = Self::new();

        for kind in ChannelKind::ALL {
            let adapter: Option<Arc<dyn ChannelAdapter>> = match kind {
                ChannelKind::VoiceCall => config.voice_call.as_ref().map(|voice| {
                    let mut channel = VoiceCallChannel::new(voice.clone(), client.clone());
                    if let Some(incident) = &config.incident {
                        channel = channel.with_directory(
                            OnCallDirectory::from_config(incident, client.clone()),
                            incident.schedule.clone(),
                        );
                    }
                    Arc::new(channel) as Arc<dyn ChannelAdapter>
                }),
                ChannelKind::Incident => config.incident.as_ref().map(|incident| {
                    Arc::new(IncidentChannel::from_config(incident, client.clone()))
                        as Arc<dyn ChannelAdapter>
                }),
                ChannelKind::ChatWebhook => config.chat_webhook.as_ref().map(|chat| {
                    Arc::new(ChatWebhookChannel::from_config(chat, client.clone()))
                        as Arc<dyn ChannelAdapter>
                }),
            };

            let Some(adapter) = adapter else {
                debug!(channel = %kind, "Channel not configured, skipping");
                continue;
            };
            registry.register(Channel::from_tuning(kind, config.tuning(kind)), adapter)?;
        }

        info!(channels = ?registry.names(), "Channel registry built");
        Ok(registry)
    }

    /// Add a channel. Disabled channels are silently left out.
    pub fn register(&mut self, channel: Channel, adapter: Arc<dyn ChannelAdapter>) -> Result<()> {
        if !channel.enabled {
            debug!(channel = %channel.name, "Channel disabled, not registered");
            return Ok(());
        }
        if self.entries.iter().any(|e| e.channel.name == channel.name) {
            return Err(EscalationError::DuplicateChannel { name: channel.name });
        }

        let position = self
            .entries
            .iter()
            .position(|e| e.channel.tier > channel.tier)
            .unwrap_or(self.entries.len());
        debug!(channel = %channel.name, tier = channel.tier, "Channel registered");
        self.entries.insert(position, Registered { channel, adapter });
        Ok(())
    }

    /// Enabled channels, tier ascending, registration order within a tier.
    pub fn enabled_channels(&self) -> impl Iterator<Item = &Channel> {
        self.entries.iter().map(|e| &e.channel)
    }

    /// Enabled channels grouped by tier.
    #[must_use]
    pub fn tiers(&self) -> Vec<Vec<Channel>> {
        let mut tiers: Vec<Vec<Channel>> = Vec::new();
        for channel in self.enabled_channels() {
            match tiers.last_mut() {
                Some(tier) if tier[0].tier == channel.tier => tier.push(channel.clone()),
                _ => tiers.push(vec![channel.clone()]),
            }
        }
        tiers
    }

    #[must_use]
    pub fn adapter_for(&self, channel: &str) -> Option<Arc<dyn ChannelAdapter>> {
        self.entries
            .iter()
            .find(|e| e.channel.name == channel)
            .map(|e| Arc::clone(&e.adapter))
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.enabled_channels().map(|c| c.name.clone()).collect()
    }
}

mod millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }
}
