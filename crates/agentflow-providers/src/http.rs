//! Shared HTTP plumbing: client construction, cancellable send, status mapping.

use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use agentflow_core::error::{AgentFlowError, Result};

/// Generation can take minutes on local hardware.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

pub(crate) fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_else(|e| {
            warn!(%e, "Failed to build HTTP client with timeout, using defaults");
            reqwest::Client::new()
        })
}

/// Send a request, aborting it if `cancel` fires first. Non-2xx responses
/// become [`AgentFlowError::Status`] carrying the response body.
pub(crate) async fn send(
    provider: &str,
    cancel: &CancellationToken,
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response> {
    let response = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(provider, "Request cancelled before response");
            return Err(AgentFlowError::Cancelled);
        }
        result = request.send() => result.map_err(|e| AgentFlowError::Transport(e.to_string()))?,
    };

    let status = response.status();
    if !status.is_success() {
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentFlowError::Cancelled),
            body = response.text() => body.unwrap_or_default(),
        };
        warn!(provider, status = status.as_u16(), "Provider returned error status");
        return Err(AgentFlowError::Status {
            provider: provider.to_string(),
            status: status.as_u16(),
            body,
        });
    }

    Ok(response)
}

/// Read and decode a whole JSON body, honoring cancellation.
pub(crate) async fn read_json<T: DeserializeOwned>(
    cancel: &CancellationToken,
    response: reqwest::Response,
) -> Result<T> {
    let bytes = tokio::select! {
        _ = cancel.cancelled() => return Err(AgentFlowError::Cancelled),
        bytes = response.bytes() => bytes.map_err(|e| AgentFlowError::Transport(e.to_string()))?,
    };
    serde_json::from_slice(&bytes).map_err(|e| AgentFlowError::Decode(e.to_string()))
}
