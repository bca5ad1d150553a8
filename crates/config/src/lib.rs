//! Startup configuration for the callout escalation dispatcher.
//!
//! Everything is read once from environment variables and then shared as an
//! immutable value. Each notification channel is enabled only when its
//! connection settings are present:
//!
//! - `CALLOUT_TWILIO_*`: voice call through a Twilio Studio flow
//! - `CALLOUT_OPSGENIE_*`: incident creation and on-call lookup in Opsgenie
//! - `CALLOUT_SLACK_*`: chat webhook
//!
//! A channel counts as configured as soon as one of its connection variables
//! is set. A configured channel with a missing or malformed value is rejected
//! on its own; the remaining channels stay usable. Startup only fails when no
//! channel is left.
//!
//! Escalation tuning uses `CALLOUT_{VOICE,INCIDENT,CHAT}_{TIER,MAX_RETRIES,
//! BACKOFF_MS,BACKOFF_CAP_MS,ENABLED}` plus the global
//! `CALLOUT_ATTEMPT_TIMEOUT_SECS` and `CALLOUT_RETENTION_SECS`.

pub mod error;

pub use error::ConfigError;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use tracing::{debug, error, info, warn};
use url::Url;

const ENV_BIND_ADDRESS: &str = "CALLOUT_BIND_ADDRESS";
const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
const ENV_BIND_PORT: &str = "CALLOUT_BIND_PORT";
const DEFAULT_BIND_PORT: u16 = 2368;

const ENV_TWILIO_BASEURL: &str = "CALLOUT_TWILIO_BASEURL";
const ENV_TWILIO_TOKEN: &str = "CALLOUT_TWILIO_TOKEN";
const ENV_TWILIO_WORKFLOW: &str = "CALLOUT_TWILIO_WORKFLOW";
const ENV_TWILIO_FROM: &str = "CALLOUT_TWILIO_FROM";
const ENV_TWILIO_TO: &str = "CALLOUT_TWILIO_TO";
const DEFAULT_TWILIO_BASEURL: &str = "https://studio.twilio.com/v2/Flows/";

const ENV_OPSGENIE_BASEURL: &str = "CALLOUT_OPSGENIE_BASEURL";
const ENV_OPSGENIE_TOKEN: &str = "CALLOUT_OPSGENIE_TOKEN";
const ENV_OPSGENIE_SCHEDULE: &str = "CALLOUT_OPSGENIE_SCHEDULE";
const DEFAULT_OPSGENIE_BASEURL: &str = "https://api.opsgenie.com/v2/";

const ENV_SLACK_BASEURL: &str = "CALLOUT_SLACK_BASEURL";
const ENV_SLACK_TOKEN: &str = "CALLOUT_SLACK_TOKEN";

const ENV_ATTEMPT_TIMEOUT_SECS: &str = "CALLOUT_ATTEMPT_TIMEOUT_SECS";
const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 10;
const ENV_RETENTION_SECS: &str = "CALLOUT_RETENTION_SECS";
const DEFAULT_RETENTION_SECS: u64 = 3600;

const DEFAULT_BACKOFF_MS: u64 = 2_000;
const DEFAULT_BACKOFF_CAP_MS: u64 = 60_000;

/// The notification channels the dispatcher knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKind {
    /// Automated phone call through a Twilio Studio flow.
    VoiceCall,
    /// Alert filed in Opsgenie.
    Incident,
    /// Message posted to a Slack webhook.
    ChatWebhook,
}

impl ChannelKind {
    /// All kinds in their default escalation order.
    pub const ALL: [Self; 3] = [Self::VoiceCall, Self::Incident, Self::ChatWebhook];

    /// Channel name used in logs, attempt records and the HTTP API.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::VoiceCall => "voice-call",
            Self::Incident => "incident",
            Self::ChatWebhook => "chat-webhook",
        }
    }

    const fn tuning_prefix(&self) -> &'static str {
        match self {
            Self::VoiceCall => "CALLOUT_VOICE",
            Self::Incident => "CALLOUT_INCIDENT",
            Self::ChatWebhook => "CALLOUT_CHAT",
        }
    }

    /// Variables whose presence marks the channel as configured.
    const fn connection_vars(&self) -> &'static [&'static str] {
        match self {
            Self::VoiceCall => &[
                ENV_TWILIO_BASEURL,
                ENV_TWILIO_TOKEN,
                ENV_TWILIO_WORKFLOW,
                ENV_TWILIO_FROM,
                ENV_TWILIO_TO,
            ],
            Self::Incident => &[
                ENV_OPSGENIE_BASEURL,
                ENV_OPSGENIE_TOKEN,
                ENV_OPSGENIE_SCHEDULE,
            ],
            Self::ChatWebhook => &[ENV_SLACK_BASEURL, ENV_SLACK_TOKEN],
        }
    }

    /// Default tuning: voice first, incident and chat together afterwards.
    #[must_use]
    pub const fn default_tuning(&self) -> ChannelTuning {
        let (tier, max_retries) = match self {
            Self::VoiceCall => (0, 2),
            Self::Incident => (1, 3),
            Self::ChatWebhook => (1, 1),
        };
        ChannelTuning {
            enabled: true,
            tier,
            max_retries,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_MS),
            backoff_cap: Duration::from_millis(DEFAULT_BACKOFF_CAP_MS),
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Escalation behaviour of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTuning {
    /// Explicit switch; a configured channel can still be kept out of escalation.
    pub enabled: bool,
    /// Priority tier, lower tiers are attempted first.
    pub tier: u32,
    /// Retries after the first attempt before the channel is given up.
    pub max_retries: u32,
    /// Delay before the first retry; doubles for every further retry.
    pub backoff_base: Duration,
    /// Upper bound for the retry delay.
    pub backoff_cap: Duration,
}

/// Twilio Studio flow used to ring the on-call person.
#[derive(Debug, Clone)]
pub struct VoiceCallConfig {
    pub base_url: Url,
    /// Sent verbatim as the `Authorization` header.
    pub token: SecretString,
    pub workflow_id: String,
    pub from_number: String,
    /// Numbers rung when neither the alert nor the on-call schedule provide any.
    pub to_numbers: Vec<String>,
}

/// Opsgenie API access.
#[derive(Debug, Clone)]
pub struct IncidentConfig {
    pub base_url: Url,
    pub token: SecretString,
    /// On-call schedule (by name) used to look up phone numbers for the voice channel.
    pub schedule: Option<String>,
}

/// Slack incoming webhook.
#[derive(Debug, Clone)]
pub struct ChatWebhookConfig {
    pub url: Url,
    pub token: SecretString,
}

/// Complete dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub bind_address: String,
    pub bind_port: u16,

    pub voice_call: Option<VoiceCallConfig>,
    pub incident: Option<IncidentConfig>,
    pub chat_webhook: Option<ChatWebhookConfig>,

    tuning: HashMap<ChannelKind, ChannelTuning>,

    /// Caller-imposed limit for a single delivery attempt.
    pub attempt_timeout: Duration,
    /// How long settled alerts stay queryable.
    pub retention: Duration,

    /// Channels that were configured but rejected at startup.
    pub rejected: Vec<(ChannelKind, ConfigError)>,
}

impl DispatcherConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let bind_address = env
            .get(ENV_BIND_ADDRESS)
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());
        let bind_port = env.parse_or(ENV_BIND_PORT, DEFAULT_BIND_PORT)?;
        debug!(%bind_address, bind_port, "Bind address resolved");

        let mut tuning = HashMap::new();
        for kind in ChannelKind::ALL {
            tuning.insert(kind, env.tuning(kind)?);
        }

        let attempt_timeout = Duration::from_secs(
            env.parse_or(ENV_ATTEMPT_TIMEOUT_SECS, DEFAULT_ATTEMPT_TIMEOUT_SECS)?,
        );
        if attempt_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                envname: ENV_ATTEMPT_TIMEOUT_SECS.to_string(),
                value: "0".to_string(),
                reason: "attempt timeout must be positive".to_string(),
            });
        }
        let retention =
            Duration::from_secs(env.parse_or(ENV_RETENTION_SECS, DEFAULT_RETENTION_SECS)?);

        let mut rejected = Vec::new();
        let voice_call = env.channel(ChannelKind::VoiceCall, &mut rejected, load_voice_call);
        let incident = env.channel(ChannelKind::Incident, &mut rejected, load_incident);
        let chat_webhook = env.channel(ChannelKind::ChatWebhook, &mut rejected, load_chat_webhook);

        let config = Self {
            bind_address,
            bind_port,
            voice_call,
            incident,
            chat_webhook,
            tuning,
            attempt_timeout,
            retention,
            rejected,
        };

        if config.enabled_kinds().is_empty() {
            return Err(ConfigError::NoChannels);
        }

        info!(
            channels = ?config.enabled_kinds(),
            attempt_timeout_secs = config.attempt_timeout.as_secs(),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Escalation tuning for a channel.
    #[must_use]
    pub fn tuning(&self, kind: ChannelKind) -> ChannelTuning {
        self.tuning
            .get(&kind)
            .copied()
            .unwrap_or_else(|| kind.default_tuning())
    }

    /// Whether connection settings for `kind` were loaded.
    #[must_use]
    pub const fn is_configured(&self, kind: ChannelKind) -> bool {
        match kind {
            ChannelKind::VoiceCall => self.voice_call.is_some(),
            ChannelKind::Incident => self.incident.is_some(),
            ChannelKind::ChatWebhook => self.chat_webhook.is_some(),
        }
    }

    /// Whether `kind` takes part in escalation.
    #[must_use]
    pub fn is_enabled(&self, kind: ChannelKind) -> bool {
        self.is_configured(kind) && self.tuning(kind).enabled
    }

    /// Channels taking part in escalation, in declaration order.
    #[must_use]
    pub fn enabled_kinds(&self) -> Vec<ChannelKind> {
        ChannelKind::ALL
            .into_iter()
            .filter(|kind| self.is_enabled(*kind))
            .collect()
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Empty values count as unset.
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn require(&self, name: &str) -> Result<String, ConfigError> {
        self.get(name).ok_or_else(|| ConfigError::MissingRequiredValue {
            envname: name.to_string(),
        })
    }

    fn require_secret(&self, name: &str) -> Result<SecretString, ConfigError> {
        self.require(name).map(SecretString::from)
    }

    fn parse_or<T>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let Some(value) = self.get(name) else {
            return Ok(default);
        };
        match value.parse() {
            Ok(parsed) => Ok(parsed),
            Err(e) => Err(ConfigError::InvalidValue {
                envname: name.to_string(),
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn url_or(&self, name: &str, default: &str, service: &str) -> Result<Url, ConfigError> {
        let raw = self.get(name).unwrap_or_else(|| default.to_string());
        parse_base_url(&raw, service)
    }

    fn tuning(&self, kind: ChannelKind) -> Result<ChannelTuning, ConfigError> {
        let prefix = kind.tuning_prefix();
        let defaults = kind.default_tuning();

        let backoff_name = format!("{prefix}_BACKOFF_MS");
        let cap_name = format!("{prefix}_BACKOFF_CAP_MS");
        let backoff_base =
            Duration::from_millis(self.parse_or(&backoff_name, millis(defaults.backoff_base))?);
        let backoff_cap =
            Duration::from_millis(self.parse_or(&cap_name, millis(defaults.backoff_cap))?);
        if backoff_cap < backoff_base {
            return Err(ConfigError::InvalidValue {
                envname: cap_name,
                value: backoff_cap.as_millis().to_string(),
                reason: format!("must not be below {backoff_name}"),
            });
        }

        Ok(ChannelTuning {
            enabled: self.parse_or(&format!("{prefix}_ENABLED"), defaults.enabled)?,
            tier: self.parse_or(&format!("{prefix}_TIER"), defaults.tier)?,
            max_retries: self.parse_or(&format!("{prefix}_MAX_RETRIES"), defaults.max_retries)?,
            backoff_base,
            backoff_cap,
        })
    }

    /// Load one channel. Unconfigured channels are skipped with a warning,
    /// broken ones are recorded in `rejected` without failing the others.
    fn channel<T>(
        &self,
        kind: ChannelKind,
        rejected: &mut Vec<(ChannelKind, ConfigError)>,
        load: fn(&Self) -> Result<T, ConfigError>,
    ) -> Option<T> {
        let configured = kind
            .connection_vars()
            .iter()
            .any(|name| self.get(name).is_some());
        if !configured {
            warn!(
                channel = %kind,
                "No settings found, {kind} notifications will be disabled"
            );
            return None;
        }

        match load(self) {
            Ok(config) => {
                info!(channel = %kind, "Channel configured");
                Some(config)
            }
            Err(e) => {
                error!(channel = %kind, error = %e, "Channel configuration rejected, channel disabled");
                rejected.push((kind, e));
                None
            }
        }
    }
}

fn load_voice_call<F>(env: &Env<F>) -> Result<VoiceCallConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(VoiceCallConfig {
        base_url: env.url_or(ENV_TWILIO_BASEURL, DEFAULT_TWILIO_BASEURL, "twilio")?,
        token: env.require_secret(ENV_TWILIO_TOKEN)?,
        workflow_id: env.require(ENV_TWILIO_WORKFLOW)?,
        from_number: env.require(ENV_TWILIO_FROM)?,
        to_numbers: env
            .get(ENV_TWILIO_TO)
            .map(|raw| split_list(&raw))
            .unwrap_or_default(),
    })
}

fn load_incident<F>(env: &Env<F>) -> Result<IncidentConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(IncidentConfig {
        base_url: env.url_or(ENV_OPSGENIE_BASEURL, DEFAULT_OPSGENIE_BASEURL, "opsgenie")?,
        token: env.require_secret(ENV_OPSGENIE_TOKEN)?,
        schedule: env.get(ENV_OPSGENIE_SCHEDULE),
    })
}

fn load_chat_webhook<F>(env: &Env<F>) -> Result<ChatWebhookConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = env.require(ENV_SLACK_BASEURL)?;
    let url = Url::parse(&raw).map_err(|source| ConfigError::InvalidUrl {
        service: "slack".to_string(),
        source,
    })?;
    Ok(ChatWebhookConfig {
        url,
        token: env.require_secret(ENV_SLACK_TOKEN)?,
    })
}

/// Parse a base URL so that relative joins append to its path.
fn parse_base_url(raw: &str, service: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(raw).map_err(|source| ConfigError::InvalidUrl {
        service: service.to_string(),
        source,
    })?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}
