//! Clients for the orchestrator's resume and flow-start endpoints

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rivulet_core::{CoreError, FlowStartMessage, FlowStartQueue, ResumeSignal, SignalError};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::error::ServerResult;

/// Delivers resume signals by POSTing `{resumeToken, payload}`.
///
/// `410 Gone` means the token expired and `404`/`400` that it is unknown.
/// Every other failure is reported as undelivered.
#[derive(Debug, Clone)]
pub struct HttpResumeSignal {
    url: Option<String>,
    client: Client,
}

impl HttpResumeSignal {
    /// Create a signal client; without a URL every delivery fails
    pub fn new(url: Option<String>, timeout: Duration) -> ServerResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl ResumeSignal for HttpResumeSignal {
    async fn send_resume(&self, resume_token: &str, payload: &Value) -> Result<(), SignalError> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| SignalError::Failed("no orchestrator resume URL configured".to_string()))?;

        debug!(url = %url, "Sending resume signal");
        let response = self
            .client
            .post(url)
            .json(&json!({ "resumeToken": resume_token, "payload": payload }))
            .send()
            .await
            .map_err(|e| {
                error!(url = %url, error = %e, "Resume signal transport failure");
                SignalError::Failed(e.to_string())
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        warn!(url = %url, status = %status, "Resume signal rejected");
        match status {
            StatusCode::GONE => Err(SignalError::TokenExpired(body)),
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST => Err(SignalError::InvalidToken(body)),
            _ => Err(SignalError::Failed(format!("status {}: {}", status, body))),
        }
    }
}

/// Publishes flow-start messages by POSTing them as JSON
#[derive(Debug, Clone)]
pub struct HttpFlowStartQueue {
    url: Option<String>,
    client: Client,
}

impl HttpFlowStartQueue {
    /// Create a queue client; without a URL every enqueue fails
    pub fn new(url: Option<String>, timeout: Duration) -> ServerResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl FlowStartQueue for HttpFlowStartQueue {
    async fn enqueue(&self, message: FlowStartMessage) -> Result<(), CoreError> {
        let url = self.url.as_deref().ok_or_else(|| {
            CoreError::ConfigurationError("no orchestrator start URL configured".to_string())
        })?;

        debug!(
            url = %url,
            flow_definition_id = %message.flow_definition_id,
            flow_version = message.flow_version,
            "Publishing flow start"
        );
        let response = self
            .client
            .post(url)
            .json(&message)
            .send()
            .await
            .map_err(|e| CoreError::Other(format!("flow start transport failure: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(url = %url, status = %status, "Flow start rejected");
            let message = format!("flow start rejected with status {}: {}", status, body);
            return Err(if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
                CoreError::ValidationError(message)
            } else {
                CoreError::Other(message)
            });
        }
        Ok(())
    }
}
