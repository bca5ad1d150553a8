//! Shared helpers for provider HTTP calls.

use reqwest::header::RETRY_AFTER;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{trace, warn};

use crate::error::ChannelError;

/// Send a request and parse the JSON body of a successful response.
pub(crate) async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ChannelError> {
    let response = send(request).await?;
    let parsed = response.json().await?;
    Ok(parsed)
}

/// Send a request whose success is decided by the status code alone.
///
/// The body of an accepted request is parsed for logging only; an
/// unreadable or unexpected body yields `None`, never an error.
pub(crate) async fn send_accepted<T: DeserializeOwned>(
    request: RequestBuilder,
) -> Result<Option<T>, ChannelError> {
    let response = send(request).await?;
    let status = response.status();
    let url = response.url().to_string();

    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => {
            warn!(%status, %url, error = %e, "Could not read body of accepted request");
            return Ok(None);
        }
    };
    match serde_json::from_str(&body) {
        Ok(parsed) => Ok(Some(parsed)),
        Err(e) => {
            warn!(%status, %url, error = %e, body = %body.trim(), "Unexpected body for accepted request");
            Ok(None)
        }
    }
}

/// Send a request and turn non-success responses into errors.
pub(crate) async fn send(request: RequestBuilder) -> Result<Response, ChannelError> {
    let response = request.send().await?;
    trace!(status = %response.status(), url = %response.url(), "Got response from provider");
    error_for_status(response).await
}

/// Like `Response::error_for_status`, but keeps the response body as context.
async fn error_for_status(response: Response) -> Result<Response, ChannelError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0);
        return Err(ChannelError::RateLimited { retry_after_secs });
    }

    let url = response.url().to_string();
    let body = match response.text().await {
        Ok(text) => text.trim().to_string(),
        Err(e) => format!("<undecodable response body: {e}>"),
    };

    Err(ChannelError::Status { status, url, body })
}
