//! Opsgenie channel: alert creation and on-call lookup.

use std::fmt;

use async_trait::async_trait;
use callout_config::{ChannelKind, IncidentConfig};
use futures::future::join_all;
use reqwest::header::AUTHORIZATION;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use url::{ParseError, Url};

use crate::error::ChannelError;
use crate::http;
use crate::notice::AlertNotice;
use crate::ChannelAdapter;

/// Opsgenie rejects longer alert messages.
const MAX_MESSAGE_LEN: usize = 130;

const ALERT_SOURCE: &str = "callout";

fn genie_key(token: &SecretString) -> String {
    format!("GenieKey {}", token.expose_secret())
}

/// Append percent-encoded path segments to an API base URL.
fn endpoint(base_url: &Url, segments: &[&str]) -> Result<Url, ChannelError> {
    let mut url = base_url.clone();
    url.path_segments_mut()
        .map_err(|()| {
            ChannelError::InvalidUrl(ParseError::RelativeUrlWithCannotBeABaseBase)
        })?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// An Opsgenie schedule, by name or by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "identifier", rename_all = "lowercase")]
pub enum ScheduleRef {
    Name(String),
    Id(String),
}

impl ScheduleRef {
    #[must_use]
    pub fn identifier(&self) -> &str {
        match self {
            Self::Name(value) | Self::Id(value) => value,
        }
    }

    /// Value of Opsgenie's `scheduleIdentifierType` parameter.
    #[must_use]
    pub const fn identifier_type(&self) -> &'static str {
        match self {
            Self::Name(_) => "name",
            Self::Id(_) => "id",
        }
    }
}

impl fmt::Display for ScheduleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.identifier_type(), self.identifier())
    }
}

/// Files alerts in Opsgenie.
pub struct IncidentChannel {
    base_url: Url,
    token: SecretString,
    client: reqwest::Client,
}

impl IncidentChannel {
    #[must_use]
    pub fn new(base_url: Url, token: SecretString, client: reqwest::Client) -> Self {
        Self {
            base_url,
            token,
            client,
        }
    }

    #[must_use]
    pub fn from_config(config: &IncidentConfig, client: reqwest::Client) -> Self {
        Self::new(config.base_url.clone(), config.token.clone(), client)
    }

    fn build_request(alert: &AlertNotice) -> CreateAlertRequest {
        let details = alert
            .details()
            .into_iter()
            .map(|(key, value)| (key, serde_json::Value::String(value)))
            .collect();

        CreateAlertRequest {
            message: truncate(&alert.summary(), MAX_MESSAGE_LEN),
            alias: alert.id.to_string(),
            description: alert.text("description"),
            priority: alert.severity().priority().to_string(),
            source: ALERT_SOURCE.to_string(),
            details,
        }
    }
}

#[async_trait]
impl ChannelAdapter for IncidentChannel {
    fn name(&self) -> &str {
        ChannelKind::Incident.name()
    }

    #[instrument(skip_all, fields(channel = "incident", alert_id = %alert.id))]
    async fn send(&self, alert: &AlertNotice) -> Result<(), ChannelError> {
        let url = endpoint(&self.base_url, &["alerts"])?;
        let request = Self::build_request(alert);

        let accepted: Option<CreateAlertResponse> = http::send_accepted(
            self.client
                .post(url)
                .header(AUTHORIZATION, genie_key(&self.token))
                .json(&request),
        )
        .await?;

        match accepted {
            Some(response) => {
                info!(request_id = %response.request_id, "Opsgenie accepted the alert");
            }
            None => info!("Opsgenie accepted the alert"),
        }
        Ok(())
    }
}

/// Looks up who is on call and how to ring them.
#[derive(Clone)]
pub struct OnCallDirectory {
    base_url: Url,
    token: SecretString,
    client: reqwest::Client,
}

impl OnCallDirectory {
    #[must_use]
    pub fn new(base_url: Url, token: SecretString, client: reqwest::Client) -> Self {
        Self {
            base_url,
            token,
            client,
        }
    }

    #[must_use]
    pub fn from_config(config: &IncidentConfig, client: reqwest::Client) -> Self {
        Self::new(config.base_url.clone(), config.token.clone(), client)
    }

    /// Voice numbers of everyone currently on call for a schedule.
    ///
    /// Users whose contacts cannot be read are skipped. When that leaves no
    /// number, the first transient lookup error is returned so the caller
    /// can retry.
    #[instrument(skip_all, fields(schedule = %schedule))]
    pub async fn on_call_numbers(
        &self,
        schedule: &ScheduleRef,
    ) -> Result<Vec<String>, ChannelError> {
        let url = endpoint(&self.base_url, &["schedules", schedule.identifier(), "on-calls"])?;
        let on_call: OnCallResult = http::send_json(
            self.client
                .get(url)
                .header(AUTHORIZATION, genie_key(&self.token))
                .query(&[
                    ("flat", "true"),
                    ("scheduleIdentifierType", schedule.identifier_type()),
                ]),
        )
        .await?;

        let recipients = on_call.data.on_call_recipients;
        if recipients.is_empty() {
            return Err(ChannelError::NoRecipients(format!(
                "nobody is on call for schedule {schedule}"
            )));
        }
        debug!(?recipients, "Resolved on-call recipients");

        let lookups = recipients.iter().map(|user| self.voice_numbers(user));
        let mut numbers = Vec::new();
        let mut first_transient = None;
        for (user, result) in recipients.iter().zip(join_all(lookups).await) {
            match result {
                Ok(found) if found.is_empty() => {
                    warn!(%user, "On-call user has no voice contact");
                }
                Ok(found) => numbers.extend(found),
                Err(e) => {
                    warn!(%user, error = %e, "Failed to look up contact details");
                    if e.is_transient() && first_transient.is_none() {
                        first_transient = Some(e);
                    }
                }
            }
        }

        if numbers.is_empty() {
            return Err(first_transient.unwrap_or_else(|| {
                ChannelError::NoRecipients(format!(
                    "no on-call user of schedule {schedule} has a voice contact"
                ))
            }));
        }
        Ok(numbers)
    }

    async fn voice_numbers(&self, user: &str) -> Result<Vec<String>, ChannelError> {
        let url = endpoint(&self.base_url, &["users", user])?;
        let contact: ContactResult = http::send_json(
            self.client
                .get(url)
                .header(AUTHORIZATION, genie_key(&self.token))
                .query(&[("expand", "contact")]),
        )
        .await?;

        Ok(contact
            .data
            .user_contacts
            .into_iter()
            .filter(|c| c.enabled && c.contact_method == "voice")
            .map(|c| format_phone_number(&c.to))
            .collect())
    }
}

/// Opsgenie stores numbers as `49-1701234`; Twilio wants `+491701234`.
fn format_phone_number(number: &str) -> String {
    let digits = number.replace('-', "");
    if digits.starts_with('+') {
        digits
    } else {
        format!("+{digits}")
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

// =============================================================================
// Opsgenie API types
// =============================================================================

#[derive(Debug, Serialize)]
struct CreateAlertRequest {
    message: String,
    alias: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    priority: String,
    source: String,
    details: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateAlertResponse {
    #[serde(default)]
    request_id: String,
}

#[derive(Debug, Deserialize)]
struct OnCallResult {
    data: OnCallData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnCallData {
    #[serde(default)]
    on_call_recipients: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ContactResult {
    data: ContactData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContactData {
    #[serde(default)]
    user_contacts: Vec<UserContact>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserContact {
    to: String,
    contact_method: String,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
}

const fn enabled_by_default() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Outcome;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn notice(payload: serde_json::Value) -> AlertNotice {
        let serde_json::Value::Object(map) = payload else {
            unreachable!()
        };
        AlertNotice::new(Uuid::new_v4(), Utc::now(), Arc::new(map))
    }

    fn base_url(server: &MockServer) -> Url {
        Url::parse(&format!("{}/v2/", server.uri())).unwrap()
    }

    fn secret() -> SecretString {
        SecretString::from("secret".to_string())
    }

    fn directory(server: &MockServer) -> OnCallDirectory {
        OnCallDirectory::new(base_url(server), secret(), reqwest::Client::new())
    }

    async fn mount_on_call(server: &MockServer, schedule_path: &str, users: &[&str]) {
        Mock::given(method("GET"))
            .and(path(schedule_path))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"onCallRecipients": users}
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn test_format_phone_number() {
        assert_eq!(format_phone_number("49-1701234"), "+491701234");
        assert_eq!(format_phone_number("+49-170"), "+49170");
    }

    #[test]
    fn test_request_truncates_message() {
        let long = "x".repeat(300);
        let alert = notice(json!({"message": long, "severity": "info"}));
        let request = IncidentChannel::build_request(&alert);
        assert_eq!(request.message.chars().count(), MAX_MESSAGE_LEN);
        assert_eq!(request.priority, "P4");
        assert_eq!(request.alias, alert.id.to_string());
    }

    #[test]
    fn test_endpoint_encodes_segments() {
        let base = Url::parse("https://api.opsgenie.com/v2/").unwrap();
        assert_eq!(
            endpoint(&base, &["users", "jane@example.com"]).unwrap().as_str(),
            "https://api.opsgenie.com/v2/users/jane@example.com"
        );
        assert_eq!(
            endpoint(&base, &["schedules", "ops#1/../x?y", "on-calls"])
                .unwrap()
                .path(),
            "/v2/schedules/ops%231%2F..%2Fx%3Fy/on-calls"
        );
    }

    #[test]
    fn test_schedule_ref_serialization() {
        let by_id = ScheduleRef::Id("d875alp4".to_string());
        assert_eq!(
            serde_json::to_value(&by_id).unwrap(),
            json!({"type": "id", "identifier": "d875alp4"})
        );
        assert_eq!(by_id.to_string(), "id d875alp4");
    }

    #[tokio::test]
    async fn test_alert_created() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/alerts"))
            .and(header("authorization", "GenieKey secret"))
            .and(body_partial_json(json!({"message": "Disk full", "priority": "P1", "source": "callout"})))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "result": "Request will be processed",
                "took": 0.2,
                "requestId": "43a29c5c"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let channel = IncidentChannel::new(base_url(&server), secret(), reqwest::Client::new());
        let outcome = channel.deliver(&notice(json!({"message": "Disk full"}))).await;
        assert_eq!(outcome, Outcome::Delivered);
    }

    #[tokio::test]
    async fn test_accepted_alert_with_unexpected_body_is_delivered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/alerts"))
            .respond_with(ResponseTemplate::new(202).set_body_string("Accepted"))
            .expect(1)
            .mount(&server)
            .await;

        let channel = IncidentChannel::new(base_url(&server), secret(), reqwest::Client::new());
        let outcome = channel.deliver(&notice(json!({"message": "Disk full"}))).await;
        assert_eq!(outcome, Outcome::Delivered);
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let channel = IncidentChannel::new(base_url(&server), secret(), reqwest::Client::new());
        let outcome = channel.deliver(&notice(json!({}))).await;
        assert!(matches!(outcome, Outcome::TransientFailure(_)));
    }

    #[tokio::test]
    async fn test_on_call_numbers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/schedules/ops/on-calls"))
            .and(query_param("flat", "true"))
            .and(query_param("scheduleIdentifierType", "name"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"onCallRecipients": ["jane@example.com", "joe@example.com"]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/users/jane@example.com"))
            .and(query_param("expand", "contact"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"userContacts": [
                    {"to": "49-1701", "contactMethod": "voice", "enabled": true},
                    {"to": "jane@example.com", "contactMethod": "email", "enabled": true},
                    {"to": "49-1702", "contactMethod": "voice", "enabled": false}
                ]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/users/joe@example.com"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let numbers = directory(&server)
            .on_call_numbers(&ScheduleRef::Name("ops".to_string()))
            .await
            .unwrap();
        assert_eq!(numbers, vec!["+491701".to_string()]);
    }

    #[tokio::test]
    async fn test_on_call_numbers_by_schedule_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/schedules/d875alp4/on-calls"))
            .and(query_param("scheduleIdentifierType", "id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"onCallRecipients": ["jane@example.com"]}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/users/jane@example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"userContacts": [{"to": "49-1701", "contactMethod": "voice"}]}
            })))
            .mount(&server)
            .await;

        let numbers = directory(&server)
            .on_call_numbers(&ScheduleRef::Id("d875alp4".to_string()))
            .await
            .unwrap();
        assert_eq!(numbers, vec!["+491701".to_string()]);
    }

    #[tokio::test]
    async fn test_contact_lookup_outage_is_transient() {
        let server = MockServer::start().await;
        mount_on_call(&server, "/v2/schedules/ops/on-calls", &["jane@example.com"]).await;
        Mock::given(method("GET"))
            .and(path("/v2/users/jane@example.com"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = directory(&server)
            .on_call_numbers(&ScheduleRef::Name("ops".to_string()))
            .await
            .unwrap_err();
        assert!(err.is_transient(), "{err} should be transient");
    }

    #[tokio::test]
    async fn test_contact_lookup_client_error_means_no_recipients() {
        let server = MockServer::start().await;
        mount_on_call(&server, "/v2/schedules/ops/on-calls", &["jane@example.com"]).await;
        Mock::given(method("GET"))
            .and(path("/v2/users/jane@example.com"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = directory(&server)
            .on_call_numbers(&ScheduleRef::Name("ops".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::NoRecipients(_)));
    }

    #[tokio::test]
    async fn test_user_name_is_encoded_in_path() {
        let server = MockServer::start().await;
        mount_on_call(&server, "/v2/schedules/ops/on-calls", &["a#b?c"]).await;
        Mock::given(method("GET"))
            .and(path("/v2/users/a%23b%3Fc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"userContacts": [{"to": "49-1", "contactMethod": "voice"}]}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let numbers = directory(&server)
            .on_call_numbers(&ScheduleRef::Name("ops".to_string()))
            .await
            .unwrap();
        assert_eq!(numbers, vec!["+491".to_string()]);
    }

    #[tokio::test]
    async fn test_nobody_on_call() {
        let server = MockServer::start().await;
        mount_on_call(&server, "/v2/schedules/ops/on-calls", &[]).await;

        let err = directory(&server)
            .on_call_numbers(&ScheduleRef::Name("ops".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::NoRecipients(_)));
    }
}
