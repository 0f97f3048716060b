//! Error responses for the Rivulet Server API
//!
//! Every failure uses the same envelope:
//! `{"error": ..., "errorDetails": {"errorCode": ..., "errorMessage": ...}}`.

use axum::{http::StatusCode, response::IntoResponse, Json};
use rivulet_core::{CoreError, ResumeError, RetryableFailure};
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::error::ServerError;

/// API Error type for returning standard error responses
#[derive(Debug)]
pub enum ApiError {
    /// Bad request (400)
    BadRequest(String),
    /// Not found (404)
    NotFound(String),
    /// Gone (410)
    Gone(String),
    /// Payload too large (413)
    PayloadTooLarge(String),
    /// Internal server error (500)
    InternalServerError(String),
    /// Bad gateway (502)
    BadGateway(String),
    /// Service unavailable (503)
    ServiceUnavailable(String),
    /// The step failed in a way the orchestrator should retry (503)
    Retryable(RetryableFailure),
    /// Wrapped server error
    ServerError(ServerError),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::BadRequest(msg) => write!(f, "Bad Request: {}", msg),
            ApiError::NotFound(msg) => write!(f, "Not Found: {}", msg),
            ApiError::Gone(msg) => write!(f, "Gone: {}", msg),
            ApiError::PayloadTooLarge(msg) => write!(f, "Payload Too Large: {}", msg),
            ApiError::InternalServerError(msg) => write!(f, "Internal Server Error: {}", msg),
            ApiError::BadGateway(msg) => write!(f, "Bad Gateway: {}", msg),
            ApiError::ServiceUnavailable(msg) => write!(f, "Service Unavailable: {}", msg),
            ApiError::Retryable(failure) => write!(f, "Retryable Failure: {}", failure),
            ApiError::ServerError(err) => write!(f, "Server Error: {}", err),
        }
    }
}

impl From<ServerError> for ApiError {
    fn from(err: ServerError) -> Self {
        ApiError::ServerError(err)
    }
}

impl From<RetryableFailure> for ApiError {
    fn from(failure: RetryableFailure) -> Self {
        ApiError::Retryable(failure)
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match &err {
            CoreError::FlowDefinitionNotFound(_) | CoreError::StepNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            _ if err.is_infrastructure() => ApiError::ServiceUnavailable(err.to_string()),
            _ => ApiError::BadRequest(err.to_string()),
        }
    }
}

impl From<ResumeError> for ApiError {
    fn from(err: ResumeError) -> Self {
        let message = err.to_string();
        match err {
            ResumeError::PayloadTooLarge { .. } => ApiError::PayloadTooLarge(message),
            ResumeError::NotFound(_) => ApiError::NotFound(message),
            ResumeError::TokenGone(_) => ApiError::Gone(message),
            ResumeError::SignalFailed(_) => ApiError::BadGateway(message),
            ResumeError::Store(_) => ApiError::ServiceUnavailable(message),
        }
    }
}

fn envelope(error_code: &str, message: &str) -> Value {
    json!({
        "error": message,
        "errorDetails": {
            "errorCode": error_code,
            "errorMessage": message,
        }
    })
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "ERR_BAD_REQUEST", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "ERR_NOT_FOUND", msg),
            ApiError::Gone(msg) => (StatusCode::GONE, "ERR_RESUME_TOKEN_GONE", msg),
            ApiError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, "ERR_PAYLOAD_TOO_LARGE", msg),
            ApiError::InternalServerError(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "ERR_INTERNAL_SERVER_ERROR", msg)
            }
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, "ERR_BAD_GATEWAY", msg),
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "ERR_SERVICE_UNAVAILABLE", msg)
            }
            ApiError::Retryable(failure) => {
                warn!(
                    flow_execution_id = %failure.state.flow_execution_id,
                    error_name = %failure.error.error_name,
                    "Returning retryable step failure"
                );
                let mut body = envelope("ERR_RETRYABLE_STEP_FAILURE", &failure.to_string());
                body["retryableFailure"] = json!(failure);
                return (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
            }
            ApiError::ServerError(err) => match err {
                ServerError::NotFound(resource) => (
                    StatusCode::NOT_FOUND,
                    "ERR_NOT_FOUND",
                    format!("{} not found", resource),
                ),
                ServerError::ValidationError(msg) | ServerError::DefinitionParsingError(msg) => {
                    (StatusCode::BAD_REQUEST, "ERR_VALIDATION_ERROR", msg)
                }
                other => {
                    error!(error = %other, "Unhandled server error");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "ERR_INTERNAL_SERVER_ERROR",
                        other.to_string(),
                    )
                }
            },
        };

        (status, Json(envelope(error_code, &message))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivulet_core::SignalError;

    #[test]
    fn test_core_error_mapping() {
        assert!(matches!(
            ApiError::from(CoreError::FlowDefinitionNotFound("x v1".to_string())),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from(CoreError::MetadataStoreError("down".to_string())),
            ApiError::ServiceUnavailable(_)
        ));
        assert!(matches!(
            ApiError::from(CoreError::ValidationError("bad".to_string())),
            ApiError::BadRequest(_)
        ));
    }

    #[test]
    fn test_resume_error_statuses() {
        let cases = vec![
            (ResumeError::PayloadTooLarge { size: 10, limit: 5 }, StatusCode::PAYLOAD_TOO_LARGE),
            (ResumeError::NotFound("k".to_string()), StatusCode::NOT_FOUND),
            (
                ResumeError::TokenGone(SignalError::TokenExpired("t".to_string())),
                StatusCode::GONE,
            ),
            (
                ResumeError::SignalFailed(SignalError::Failed("x".to_string())),
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.status_code(), expected.as_u16());
            assert_eq!(ApiError::from(err).into_response().status(), expected);
        }
    }
}
