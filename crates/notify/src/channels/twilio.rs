//! Twilio Studio voice call channel.

use std::collections::HashMap;

use async_trait::async_trait;
use callout_config::{ChannelKind, VoiceCallConfig};
use futures::future::join_all;
use reqwest::header::AUTHORIZATION;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::ChannelError;
use crate::http;
use crate::notice::AlertNotice;
use crate::{ChannelAdapter, OnCallDirectory, ScheduleRef};

/// Payload key holding explicit numbers to ring.
const NUMBERS_KEY: &str = "numbers";
/// Payload key naming an Opsgenie schedule to look the numbers up in.
const SCHEDULE_KEY: &str = "schedule";
/// Payload key holding an Opsgenie schedule id; wins over `schedule`.
const SCHEDULE_ID_KEY: &str = "scheduleId";

/// Rings the on-call person by starting a Twilio Studio flow execution per number.
pub struct VoiceCallChannel {
    config: VoiceCallConfig,
    directory: Option<OnCallDirectory>,
    default_schedule: Option<String>,
    client: reqwest::Client,
}

impl VoiceCallChannel {
    #[must_use]
    pub fn new(config: VoiceCallConfig, client: reqwest::Client) -> Self {
        Self {
            config,
            directory: None,
            default_schedule: None,
            client,
        }
    }

    /// Resolve numbers through the on-call schedule when the alert brings none.
    #[must_use]
    pub fn with_directory(mut self, directory: OnCallDirectory, schedule: Option<String>) -> Self {
        self.directory = Some(directory);
        self.default_schedule = schedule;
        self
    }

    /// Numbers from the alert, else from the on-call schedule, else the static list.
    async fn recipients(&self, alert: &AlertNotice) -> Result<Vec<String>, ChannelError> {
        let explicit = alert.list(NUMBERS_KEY);
        if !explicit.is_empty() {
            debug!(count = explicit.len(), "Using numbers supplied with the alert");
            return Ok(explicit);
        }

        let schedule = alert
            .text(SCHEDULE_ID_KEY)
            .map(ScheduleRef::Id)
            .or_else(|| alert.text(SCHEDULE_KEY).map(ScheduleRef::Name))
            .or_else(|| self.default_schedule.clone().map(ScheduleRef::Name));
        if let (Some(directory), Some(schedule)) = (&self.directory, schedule) {
            return directory.on_call_numbers(&schedule).await;
        }

        if self.config.to_numbers.is_empty() {
            return Err(ChannelError::NoRecipients(
                "no numbers supplied and no on-call schedule configured".to_string(),
            ));
        }
        Ok(self.config.to_numbers.clone())
    }

    fn executions_url(&self) -> Result<Url, ChannelError> {
        Ok(self
            .config
            .base_url
            .join(&format!("{}/Executions", self.config.workflow_id))?)
    }

    async fn dial(&self, url: Url, number: &str, parameters: &str) -> Result<(), ChannelError> {
        let mut form = HashMap::new();
        form.insert("From", self.config.from_number.as_str());
        form.insert("To", number);
        form.insert("Parameters", parameters);

        let execution: Option<ExecutionResponse> = http::send_accepted(
            self.client
                .post(url)
                .header(AUTHORIZATION, self.config.token.expose_secret())
                .form(&form),
        )
        .await?;

        match execution {
            Some(execution) if execution.status != "active" => {
                warn!(%number, status = %execution.status, "Flow execution accepted with unexpected status");
            }
            _ => debug!(%number, "Flow execution started"),
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelAdapter for VoiceCallChannel {
    fn name(&self) -> &str {
        ChannelKind::VoiceCall.name()
    }

    #[instrument(skip_all, fields(channel = "voice-call", alert_id = %alert.id))]
    async fn send(&self, alert: &AlertNotice) -> Result<(), ChannelError> {
        let numbers = self.recipients(alert).await?;
        let url = self.executions_url()?;
        let parameters = json!({
            "alert_id": alert.id,
            "message": alert.summary(),
            "severity": alert.severity().as_str(),
        })
        .to_string();

        info!(?numbers, workflow = %self.config.workflow_id, "These numbers will be called");

        let calls = numbers
            .iter()
            .map(|number| self.dial(url.clone(), number, &parameters));
        let results = join_all(calls).await;

        for (number, result) in numbers.iter().zip(&results) {
            if let Err(e) = result {
                warn!(%number, error = %e, "Failed to start call");
            }
        }

        summarize_dial_results(results)
    }
}

/// One started call is enough. When every call failed, report a transient
/// failure if there was one so that the attempt gets retried.
fn summarize_dial_results(
    results: Vec<Result<(), ChannelError>>,
) -> Result<(), ChannelError> {
    let mut first_error = None;
    let mut first_transient = None;

    for result in results {
        match result {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && first_transient.is_none() => first_transient = Some(e),
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    match first_transient.or(first_error) {
        Some(e) => Err(e),
        None => Err(ChannelError::NoRecipients("no numbers to call".to_string())),
    }
}

#[derive(Debug, Deserialize)]
struct ExecutionResponse {
    #[serde(default)]
    status: String,
}
