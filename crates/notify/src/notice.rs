//! The read-only view of an alert handed to channel adapters.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Opaque key/value description of an incident, as received.
pub type Payload = serde_json::Map<String, Value>;

/// Payload keys consulted, in order, for a one-line summary.
const SUMMARY_KEYS: [&str; 4] = ["message", "summary", "title", "alertname"];

/// Severity levels for alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational - normal operations
    Info,
    /// Warning - something needs attention
    Warning,
    /// Critical - immediate action required
    Critical,
}

impl Severity {
    /// Parse a free-form severity label. Unknown labels are treated as critical.
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "info" | "informational" | "low" | "p4" | "p5" => Self::Info,
            "warning" | "warn" | "medium" | "p3" => Self::Warning,
            _ => Self::Critical,
        }
    }

    /// Get display name for this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Warning => "Warning",
            Self::Critical => "Critical",
        }
    }

    /// Slack attachment color.
    #[must_use]
    pub const fn color(&self) -> &'static str {
        match self {
            Self::Info => "#3498db",     // Blue
            Self::Warning => "#f39c12",  // Orange
            Self::Critical => "#e74c3c", // Red
        }
    }

    /// Opsgenie alert priority.
    #[must_use]
    pub const fn priority(&self) -> &'static str {
        match self {
            Self::Info => "P4",
            Self::Warning => "P3",
            Self::Critical => "P1",
        }
    }
}

/// Snapshot of an alert as seen by a channel adapter.
///
/// Adapters never mutate alerts; the escalation engine hands each attempt a
/// notice that shares the immutable payload.
#[derive(Debug, Clone)]
pub struct AlertNotice {
    pub id: Uuid,
    pub received_at: DateTime<Utc>,
    pub payload: Arc<Payload>,
}

impl AlertNotice {
    #[must_use]
    pub fn new(id: Uuid, received_at: DateTime<Utc>, payload: Arc<Payload>) -> Self {
        Self {
            id,
            received_at,
            payload,
        }
    }

    /// One-line summary of the incident.
    #[must_use]
    pub fn summary(&self) -> String {
        SUMMARY_KEYS
            .iter()
            .find_map(|key| self.text(key))
            .unwrap_or_else(|| format!("Alert {}", self.id))
    }

    /// Scalar payload value rendered as text.
    #[must_use]
    pub fn text(&self, key: &str) -> Option<String> {
        self.payload.get(key).and_then(render_scalar)
    }

    #[must_use]
    pub fn severity(&self) -> Severity {
        self.text("severity")
            .map_or(Severity::Critical, |label| Severity::from_label(&label))
    }

    /// Payload entries flattened to text, in key order.
    #[must_use]
    pub fn details(&self) -> Vec<(String, String)> {
        self.payload
            .iter()
            .map(|(key, value)| {
                let rendered = render_scalar(value).unwrap_or_else(|| value.to_string());
                (key.clone(), rendered)
            })
            .collect()
    }

    /// List-valued payload entry, accepting a JSON array or a comma-separated string.
    #[must_use]
    pub fn list(&self, key: &str) -> Vec<String> {
        match self.payload.get(key) {
            Some(Value::Array(items)) => items.iter().filter_map(render_scalar).collect(),
            Some(Value::String(raw)) => raw
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(ToString::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn render_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notice(payload: Value) -> AlertNotice {
        let Value::Object(map) = payload else {
            panic!("payload must be an object");
        };
        AlertNotice::new(Uuid::new_v4(), Utc::now(), Arc::new(map))
    }

    #[test]
    fn test_summary_prefers_message() {
        let notice = notice(json!({"title": "disk", "message": "Disk full on db-1"}));
        assert_eq!(notice.summary(), "Disk full on db-1");
    }

    #[test]
    fn test_summary_falls_back_to_id() {
        let notice = notice(json!({"message": "   ", "count": 3}));
        assert_eq!(notice.summary(), format!("Alert {}", notice.id));
    }

    #[test]
    fn test_severity_parsing() {
        assert_eq!(notice(json!({"severity": "warning"})).severity(), Severity::Warning);
        assert_eq!(notice(json!({"severity": "P5"})).severity(), Severity::Info);
        assert_eq!(notice(json!({})).severity(), Severity::Critical);
    }

    #[test]
    fn test_list_accepts_array_and_csv() {
        let from_array = notice(json!({"numbers": ["+491", 492, null]}));
        assert_eq!(from_array.list("numbers"), vec!["+491", "492"]);

        let from_csv = notice(json!({"numbers": "+491, ,+492"}));
        assert_eq!(from_csv.list("numbers"), vec!["+491", "+492"]);

        assert!(from_csv.list("missing").is_empty());
    }

    #[test]
    fn test_details_render_nested_values_as_json() {
        let notice = notice(json!({"host": "db-1", "labels": {"team": "ops"}}));
        assert_eq!(
            notice.details(),
            vec![
                ("host".to_string(), "db-1".to_string()),
                ("labels".to_string(), r#"{"team":"ops"}"#.to_string()),
            ]
        );
    }
}
