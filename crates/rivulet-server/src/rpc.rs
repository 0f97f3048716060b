//! HTTP client for external step handlers
//!
//! Each registered module is reached by POSTing the handler request to its
//! endpoint. The response body is handed back to the dispatcher as-is,
//! which decides between `outputData` and a reported error.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rivulet_core::{HandlerInvoker, HandlerRegistration, HandlerRequest, InvocationError};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ServerResult;

/// Invokes external handlers over HTTP
#[derive(Debug, Clone)]
pub struct HttpHandlerInvoker {
    client: Client,
    default_timeout: Duration,
}

impl HttpHandlerInvoker {
    /// Create an invoker; `default_timeout` applies to registrations without their own
    pub fn new(default_timeout: Duration) -> ServerResult<Self> {
        Ok(Self {
            client: Client::builder().build()?,
            default_timeout,
        })
    }
}

#[async_trait]
impl HandlerInvoker for HttpHandlerInvoker {
    async fn invoke(
        &self,
        registration: &HandlerRegistration,
        request: &HandlerRequest,
    ) -> Result<Value, InvocationError> {
        let timeout = registration
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        debug!(
            module = %registration.module_identifier,
            endpoint = %registration.endpoint,
            timeout_ms = timeout.as_millis() as u64,
            "Calling external handler"
        );
        let response = self
            .client
            .post(&registration.endpoint)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| InvocationError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            warn!(module = %registration.module_identifier, status = %status, "External handler unavailable");
            return Err(InvocationError::Transport(format!(
                "handler {} returned status {}",
                registration.module_identifier, status
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| InvocationError::Transport(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| InvocationError::MalformedResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivulet_core::{ExecutionState, FlowId, StepInstance};
    use serde_json::{json, Map};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn registration(server: &MockServer) -> HandlerRegistration {
        HandlerRegistration {
            module_identifier: "fraud.score".to_string(),
            endpoint: format!("{}/score", server.uri()),
            timeout_seconds: Some(5),
        }
    }

    fn request() -> HandlerRequest {
        let step: StepInstance = serde_json::from_value(json!({
            "stepInstanceId": "score",
            "stepType": "EXTERNAL_INVOKE",
            "moduleIdentifier": "fraud.score"
        }))
        .unwrap();
        let mut input = Map::new();
        input.insert("amount".to_string(), json!(120));
        HandlerRequest {
            step_definition: step,
            step_input: input,
            execution_state: ExecutionState::new("exec-1", FlowId("payments".to_string()), 1),
        }
    }

    #[tokio::test]
    async fn test_invoke_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/score"))
            .and(body_partial_json(json!({
                "stepInput": {"amount": 120},
                "stepDefinition": {"stepInstanceId": "score"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"outputData": {"score": 0.2}})))
            .expect(1)
            .mount(&server)
            .await;

        let invoker = HttpHandlerInvoker::new(Duration::from_secs(5)).unwrap();
        let response = invoker.invoke(&registration(&server), &request()).await.unwrap();
        assert_eq!(response, json!({"outputData": {"score": 0.2}}));
    }

    #[tokio::test]
    async fn test_reported_error_is_passed_through() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(422).set_body_json(json!({"errorName": "Declined", "errorMessage": "no"})),
            )
            .mount(&server)
            .await;

        let invoker = HttpHandlerInvoker::new(Duration::from_secs(5)).unwrap();
        let response = invoker.invoke(&registration(&server), &request()).await.unwrap();
        assert_eq!(response["errorName"], "Declined");
    }

    #[tokio::test]
    async fn test_unavailable_and_malformed() {
        let server = MockServer::start().await;
        Mock::given(path("/score"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(path("/garbage"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let invoker = HttpHandlerInvoker::new(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            invoker.invoke(&registration(&server), &request()).await,
            Err(InvocationError::Transport(_))
        ));

        let mut garbage = registration(&server);
        garbage.endpoint = format!("{}/garbage", server.uri());
        assert!(matches!(
            invoker.invoke(&garbage, &request()).await,
            Err(InvocationError::MalformedResponse(_))
        ));
    }
}
