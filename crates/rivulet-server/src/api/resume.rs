//! External resume endpoint

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use super::errors::ApiError;
use crate::server::RivuletServer;

/// Body of `POST /resume`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRequest {
    /// Rendered correlation key the execution is waiting on
    pub correlation_value: String,
    /// Event payload
    #[serde(default)]
    pub payload: Value,
}

/// Resume the execution waiting on `correlationValue`.
///
/// `202` on success, `404` when nothing waits on the key, `410` when the
/// orchestrator no longer knows the token, `413` when the payload is too
/// large and `502` when the signal could not be delivered.
pub async fn resume_handler(
    State(server): State<Arc<RivuletServer>>,
    Json(request): Json<ResumeRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if request.correlation_value.is_empty() {
        return Err(ApiError::BadRequest("correlationValue must not be empty".to_string()));
    }

    let record = server
        .interpreter()
        .suspension()
        .resume(server.resume_signal(), &request.correlation_value, &request.payload)
        .await?;

    info!(
        flow_execution_id = %record.flow_execution_id,
        step_id = %record.step_instance_id,
        "Execution resumed"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "ACCEPTED",
            "flowExecutionId": record.flow_execution_id,
        })),
    ))
}
