//! Orchestrator-facing execution endpoints
//!
//! Each endpoint takes the execution state the orchestrator holds and
//! returns `{state, action}`. A retryable failure is answered with `503`
//! and carries the state to retry with.

use axum::{extract::State, Json};
use rivulet_core::{BranchResult, ErrorInfo, ExecutionState, FlowStartMessage, StepResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use super::errors::ApiError;
use crate::server::RivuletServer;

/// Body of `POST /v1/executions/suspend`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspendRequest {
    /// State returned with the SUSPEND action
    pub state: ExecutionState,
    /// Orchestrator token that resumes this execution
    pub resume_token: String,
}

/// Body of `POST /v1/executions/resume-step`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeStepRequest {
    /// State of the suspended execution
    pub state: ExecutionState,
    /// Event payload, used as the waiting step's output
    #[serde(default)]
    pub payload: Value,
}

/// Body of `POST /v1/executions/aggregate`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRequest {
    /// State returned with the FORK action
    pub state: ExecutionState,
    /// Outcome of every branch
    pub branch_results: Vec<BranchResult>,
}

/// Body of `POST /v1/executions/retries-exhausted`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetriesExhaustedRequest {
    /// State of the last attempt
    pub state: ExecutionState,
    /// The failure that kept being retried
    pub error_info: ErrorInfo,
}

/// Create and activate a new execution
pub async fn start_handler(
    State(server): State<Arc<RivuletServer>>,
    Json(message): Json<FlowStartMessage>,
) -> Result<Json<StepResult>, ApiError> {
    info!(
        flow_definition_id = %message.flow_definition_id,
        flow_version = message.flow_version,
        "Start requested"
    );
    Ok(Json(server.interpreter().start(message).await?))
}

/// Execute the current step
pub async fn execute_handler(
    State(server): State<Arc<RivuletServer>>,
    Json(state): Json<ExecutionState>,
) -> Result<Json<StepResult>, ApiError> {
    Ok(Json(server.interpreter().execute(state).await?))
}

/// Save the continuation of a waiting step
pub async fn suspend_handler(
    State(server): State<Arc<RivuletServer>>,
    Json(request): Json<SuspendRequest>,
) -> Result<Json<StepResult>, ApiError> {
    if request.resume_token.trim().is_empty() {
        return Err(ApiError::BadRequest("resumeToken must not be empty".to_string()));
    }
    Ok(Json(
        server
            .interpreter()
            .suspend(request.state, &request.resume_token)
            .await?,
    ))
}

/// Complete a waiting step with its event payload
pub async fn resume_step_handler(
    State(server): State<Arc<RivuletServer>>,
    Json(request): Json<ResumeStepRequest>,
) -> Result<Json<StepResult>, ApiError> {
    Ok(Json(
        server
            .interpreter()
            .resume_with_event(request.state, request.payload)
            .await?,
    ))
}

/// Merge branch results into the fork step
pub async fn aggregate_handler(
    State(server): State<Arc<RivuletServer>>,
    Json(request): Json<AggregateRequest>,
) -> Result<Json<StepResult>, ApiError> {
    Ok(Json(
        server
            .interpreter()
            .aggregate(request.state, request.branch_results)
            .await?,
    ))
}

/// Fail the current step after the orchestrator gave up retrying
pub async fn retries_exhausted_handler(
    State(server): State<Arc<RivuletServer>>,
    Json(request): Json<RetriesExhaustedRequest>,
) -> Result<Json<StepResult>, ApiError> {
    Ok(Json(
        server
            .interpreter()
            .retries_exhausted(request.state, request.error_info)
            .await?,
    ))
}
