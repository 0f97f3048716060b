use crate::required_str;
use async_trait::async_trait;
use reqwest::{header::HeaderMap, Client, Method, StatusCode};
use rivulet_core::{HandlerRequest, StepError, StepHandler};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Issues an HTTP request.
///
/// Inputs:
/// - `url` (required), `method` (default `GET`)
/// - `headers`: object of header values
/// - `query`: object of query parameters
/// - `body`: JSON body, sent for any method when present
/// - `timeoutSeconds`: per-request timeout
///
/// The output is `{statusCode, headers, body, isSuccess}`; a body that is not
/// JSON is returned as `{"rawBody": "..."}`. Transport failures, `429` and
/// `5xx` responses are transient. Other `4xx` responses are permanent. With
/// `failOnError: false` every response is returned as output.
#[derive(Debug, Clone)]
pub struct HttpCall {
    client: Client,
}

impl Default for HttpCall {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpCall {
    /// Module identifier
    pub const MODULE: &'static str = "StdLib:HttpCall";

    /// Create the handler with a default client
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    /// Create the handler around an existing client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn header_map(headers: &HeaderMap) -> Map<String, Value> {
        let mut map = Map::new();
        for (name, value) in headers {
            if let Ok(value) = value.to_str() {
                map.insert(name.to_string(), Value::String(value.to_string()));
            }
        }
        map
    }

    fn classify(status: StatusCode, body: &Value, url: &str) -> StepError {
        let message = format!("HTTP request to {} failed with status {}", url, status.as_u16());
        let details = json!({"statusCode": status.as_u16(), "body": body});
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            StepError::Transient {
                message,
                details: Some(details),
            }
        } else {
            StepError::permanent_with(message, details)
        }
    }
}

#[async_trait]
impl StepHandler for HttpCall {
    fn module_identifier(&self) -> &str {
        Self::MODULE
    }

    async fn execute(&self, request: &HandlerRequest) -> Result<Value, StepError> {
        let input = &request.step_input;
        let url = required_str(input, "url", Self::MODULE)?;
        let method = input
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| StepError::permanent(format!("Invalid HTTP method: {}", method)))?;
        let fail_on_error = input
            .get("failOnError")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let mut builder = self.client.request(method.clone(), url);
        if let Some(Value::Object(headers)) = input.get("headers") {
            for (name, value) in headers {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                builder = builder.header(name.as_str(), value);
            }
        }
        if let Some(Value::Object(query)) = input.get("query") {
            let pairs: Vec<(String, String)> = query
                .iter()
                .map(|(k, v)| match v {
                    Value::String(s) => (k.clone(), s.clone()),
                    other => (k.clone(), other.to_string()),
                })
                .collect();
            builder = builder.query(&pairs);
        }
        if let Some(body) = input.get("body") {
            builder = builder.json(body);
        }
        if let Some(seconds) = input.get("timeoutSeconds").and_then(Value::as_u64) {
            builder = builder.timeout(Duration::from_secs(seconds));
        }

        debug!(method = %method, url = %url, "Sending HTTP request");
        let response = builder.send().await.map_err(|e| {
            warn!(url = %url, error = %e, "HTTP request failed");
            if e.is_builder() {
                StepError::permanent(format!("Invalid HTTP request to {}: {}", url, e))
            } else {
                StepError::transient(format!("HTTP request to {} failed: {}", url, e))
            }
        })?;

        let status = response.status();
        let headers = Self::header_map(response.headers());
        let text = response
            .text()
            .await
            .map_err(|e| StepError::transient(format!("Failed to read response body: {}", e)))?;
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or_else(|_| json!({"rawBody": text}))
        };

        if fail_on_error && !status.is_success() {
            return Err(Self::classify(status, &body, url));
        }

        Ok(json!({
            "statusCode": status.as_u16(),
            "headers": headers,
            "body": body,
            "isSuccess": status.is_success(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::tests::request;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_post_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .and(header("x-tenant", "acme"))
            .and(query_param("dryRun", "true"))
            .and(body_json(json!({"sku": "a"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 7})))
            .expect(1)
            .mount(&server)
            .await;

        let output = HttpCall::new()
            .execute(&request(json!({
                "url": format!("{}/orders", server.uri()),
                "method": "post",
                "headers": {"x-tenant": "acme"},
                "query": {"dryRun": true},
                "body": {"sku": "a"}
            })))
            .await
            .unwrap();

        assert_eq!(output["statusCode"], 201);
        assert_eq!(output["body"], json!({"id": 7}));
        assert_eq!(output["isSuccess"], true);
    }

    #[tokio::test]
    async fn test_raw_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("plain text"))
            .mount(&server)
            .await;

        let output = HttpCall::new()
            .execute(&request(json!({"url": server.uri()})))
            .await
            .unwrap();
        assert_eq!(output["body"], json!({"rawBody": "plain text"}));
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        Mock::given(path("/busy"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(path("/throttled"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        Mock::given(path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"reason": "no such order"})))
            .mount(&server)
            .await;

        let call = HttpCall::new();
        let busy = call
            .execute(&request(json!({"url": format!("{}/busy", server.uri())})))
            .await
            .unwrap_err();
        assert!(busy.is_retryable());

        let throttled = call
            .execute(&request(json!({"url": format!("{}/throttled", server.uri())})))
            .await
            .unwrap_err();
        assert!(throttled.is_retryable());

        let missing = call
            .execute(&request(json!({"url": format!("{}/missing", server.uri())})))
            .await
            .unwrap_err();
        assert!(!missing.is_retryable());
        let details = missing.to_error_info().error_details.unwrap();
        assert_eq!(details, json!({"statusCode": 404, "body": {"reason": "no such order"}}));
    }

    #[tokio::test]
    async fn test_report_errors_as_output() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let output = HttpCall::new()
            .execute(&request(json!({"url": server.uri(), "failOnError": false})))
            .await
            .unwrap();
        assert_eq!(output["statusCode"], 500);
        assert_eq!(output["isSuccess"], false);
        assert_eq!(output["body"], Value::Null);
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let err = HttpCall::new()
            .execute(&request(json!({"url": "http://127.0.0.1:9/unreachable"})))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_url() {
        let err = HttpCall::new().execute(&request(json!({}))).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
