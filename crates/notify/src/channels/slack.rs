//! Slack webhook notification channel.

use async_trait::async_trait;
use callout_config::{ChannelKind, ChatWebhookConfig};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{debug, instrument};
use url::Url;

use crate::error::ChannelError;
use crate::http;
use crate::notice::AlertNotice;
use crate::ChannelAdapter;

/// Slack webhook notification channel.
pub struct ChatWebhookChannel {
    url: Url,
    token: SecretString,
    client: reqwest::Client,
}

impl ChatWebhookChannel {
    /// Create a channel posting to `url`.
    #[must_use]
    pub fn new(url: Url, token: SecretString, client: reqwest::Client) -> Self {
        Self {
            url,
            token,
            client,
        }
    }

    #[must_use]
    pub fn from_config(config: &ChatWebhookConfig, client: reqwest::Client) -> Self {
        Self::new(config.url.clone(), config.token.clone(), client)
    }

    /// Format an alert as a Slack webhook payload.
    fn format_payload(alert: &AlertNotice) -> SlackPayload {
        let severity = alert.severity();

        let fields = alert
            .details()
            .into_iter()
            .map(|(title, value)| SlackField {
                short: value.len() <= 40,
                title,
                value,
            })
            .collect();

        let attachment = SlackAttachment {
            fallback: alert.summary(),
            color: severity.color().to_string(),
            pretext: Some(":rotating_light: Alert escalation".to_string()),
            author_name: Some("callout".to_string()),
            title: alert.summary(),
            text: format!("Alert `{}` needs an acknowledgment.", alert.id),
            fields,
            footer: Some(format!(
                "{} | {}",
                severity.as_str(),
                alert.received_at.format("%Y-%m-%d %H:%M:%S UTC")
            )),
            ts: Some(alert.received_at.timestamp()),
        };

        SlackPayload {
            text: format!("[{}] {}", severity.as_str(), alert.summary()),
            attachments: vec![attachment],
        }
    }
}

#[async_trait]
impl ChannelAdapter for ChatWebhookChannel {
    fn name(&self) -> &str {
        ChannelKind::ChatWebhook.name()
    }

    #[instrument(skip_all, fields(channel = "chat-webhook", alert_id = %alert.id))]
    async fn send(&self, alert: &AlertNotice) -> Result<(), ChannelError> {
        let payload = Self::format_payload(alert);

        debug!("Posting alert to chat webhook");

        http::send(
            self.client
                .post(self.url.clone())
                .bearer_auth(self.token.expose_secret())
                .json(&payload),
        )
        .await?;

        debug!("Chat webhook accepted the alert");
        Ok(())
    }
}

// =============================================================================
// Slack API types
// =============================================================================

#[derive(Debug, Serialize)]
struct SlackPayload {
    text: String,
    attachments: Vec<SlackAttachment>,
}

#[derive(Debug, Serialize)]
struct SlackAttachment {
    fallback: String,
    color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pretext: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    author_name: Option<String>,
    title: String,
    text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<SlackField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ts: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SlackField {
    title: String,
    value: String,
    short: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Outcome;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn notice() -> AlertNotice {
        let payload = json!({"message": "Disk full", "severity": "warning", "host": "db-1"});
        let serde_json::Value::Object(map) = payload else {
            unreachable!()
        };
        AlertNotice::new(Uuid::new_v4(), Utc::now(), Arc::new(map))
    }

    fn channel(server: &MockServer) -> ChatWebhookChannel {
        let url = Url::parse(&format!("{}/services/T1/B1", server.uri())).unwrap();
        ChatWebhookChannel::new(url, SecretString::from("xoxb-test".to_string()), reqwest::Client::new())
    }

    #[test]
    fn test_payload_uses_severity_color_and_fields() {
        let payload =
            serde_json::to_value(ChatWebhookChannel::format_payload(&notice())).unwrap();
        assert_eq!(payload["text"], "[Warning] Disk full");
        assert_eq!(payload["attachments"][0]["color"], "#f39c12");
        assert_eq!(payload["attachments"][0]["fields"][0]["title"], "host");
    }

    #[tokio::test]
    async fn test_delivered_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/T1/B1"))
            .and(header("authorization", "Bearer xoxb-test"))
            .and(body_partial_json(json!({"text": "[Warning] Disk full"})))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = channel(&server).deliver(&notice()).await;
        assert_eq!(outcome, Outcome::Delivered);
    }

    #[tokio::test]
    async fn test_forbidden_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("invalid_token"))
            .mount(&server)
            .await;

        let outcome = channel(&server).deliver(&notice()).await;
        assert!(matches!(outcome, Outcome::PermanentFailure(reason) if reason.contains("invalid_token")));
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let err = channel(&server).send(&notice()).await.unwrap_err();
        assert!(matches!(err, ChannelError::RateLimited { retry_after_secs: 7 }));
    }
}
