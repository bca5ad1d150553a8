//! HTTP surface of the dispatcher.
//!
//! - `POST /alert` starts escalating the JSON body as a new alert
//! - `GET /alert?schedule=...` does the same for query parameters (legacy clients)
//! - `POST /alerts/{id}/ack` acknowledges an alert
//! - `GET /alerts/{id}` returns state and attempt log
//! - `GET /alerts` lists tracked alerts
//! - `GET /oncall?name=...` (or `?id=...`) resolves the on-call phone numbers
//! - `GET /status` health check

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use callout_escalation::{Alert, AlertState, AlertSummary, EscalationEngine, EscalationError};
use callout_notify::{ChannelError, OnCallDirectory, Payload, ScheduleRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

/// Server state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: EscalationEngine,
    /// Present when Opsgenie is configured
    pub directory: Option<OnCallDirectory>,
    pub default_schedule: Option<String>,
}

/// Build the HTTP router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/alert", post(alert_handler).get(legacy_alert_handler))
        .route("/alerts", get(list_handler))
        .route("/alerts/{id}", get(alert_status_handler))
        .route("/alerts/{id}/ack", post(ack_handler))
        .route("/oncall", get(on_call_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct StatusResponse {
    health: String,
    version: String,
    channels: Vec<String>,
    alerts: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct AlertResponse {
    id: Uuid,
    state: AlertState,
}

/// `schedule` is accepted as an alias of `name`.
#[derive(Debug, Deserialize)]
struct OnCallQuery {
    id: Option<String>,
    name: Option<String>,
    schedule: Option<String>,
}

impl OnCallQuery {
    fn into_schedule(self, default: Option<String>) -> Option<ScheduleRef> {
        self.id
            .map(ScheduleRef::Id)
            .or_else(|| self.name.or(self.schedule).or(default).map(ScheduleRef::Name))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OnCallResponse {
    schedule: ScheduleRef,
    numbers: Vec<String>,
}

/// Errors returned to HTTP clients as `{"error": "..."}`.
#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error(transparent)]
    Escalation(#[from] EscalationError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unavailable(String),

    #[error(transparent)]
    Upstream(#[from] ChannelError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Escalation(EscalationError::AlertNotFound { .. }) => StatusCode::NOT_FOUND,
            Self::Escalation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(ChannelError::NoRecipients(_)) => StatusCode::NOT_FOUND,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        health: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        channels: state.engine.registry().names(),
        alerts: state.engine.tracked().await,
    })
}

async fn alert_handler(
    State(state): State<AppState>,
    Json(payload): Json<Payload>,
) -> Result<(StatusCode, Json<AlertResponse>), ApiError> {
    start_escalation(&state.engine, payload).await
}

async fn legacy_alert_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<(StatusCode, Json<AlertResponse>), ApiError> {
    let payload: Payload = params
        .into_iter()
        .map(|(key, value)| (key, Value::String(value)))
        .collect();
    start_escalation(&state.engine, payload).await
}

async fn start_escalation(
    engine: &EscalationEngine,
    payload: Payload,
) -> Result<(StatusCode, Json<AlertResponse>), ApiError> {
    let id = engine.receive(payload).await;
    let state = engine.status(id).await?.state;
    info!(alert_id = %id, %state, "Alert accepted");
    Ok((StatusCode::ACCEPTED, Json(AlertResponse { id, state })))
}

async fn list_handler(State(state): State<AppState>) -> Json<Vec<AlertSummary>> {
    Json(state.engine.list().await)
}

async fn alert_status_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Alert>, ApiError> {
    Ok(Json(state.engine.status(id).await?))
}

async fn ack_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<AlertResponse>, ApiError> {
    let state = state.engine.acknowledge(id).await?;
    Ok(Json(AlertResponse { id, state }))
}

async fn on_call_handler(
    State(state): State<AppState>,
    Query(query): Query<OnCallQuery>,
) -> Result<Json<OnCallResponse>, ApiError> {
    let directory = state
        .directory
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("on-call lookup is not configured".to_string()))?;
    let schedule = query
        .into_schedule(state.default_schedule)
        .ok_or_else(|| ApiError::BadRequest("missing schedule".to_string()))?;

    let numbers = directory.on_call_numbers(&schedule).await?;
    Ok(Json(OnCallResponse { schedule, numbers }))
}
