//! API module for the Rivulet Server

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod errors;
pub mod executions;
pub mod health;
pub mod resume;

use crate::server::RivuletServer;

/// Build the router for API endpoints
pub fn build_router(server: Arc<RivuletServer>) -> Router {
    Router::new()
        // Orchestrator contract
        .route("/v1/executions/start", post(executions::start_handler))
        .route("/v1/executions/execute", post(executions::execute_handler))
        .route("/v1/executions/suspend", post(executions::suspend_handler))
        .route("/v1/executions/resume-step", post(executions::resume_step_handler))
        .route("/v1/executions/aggregate", post(executions::aggregate_handler))
        .route(
            "/v1/executions/retries-exhausted",
            post(executions::retries_exhausted_handler),
        )
        // External callers
        .route("/resume", post(resume::resume_handler))
        // Health check
        .route("/health", get(health::health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

pub use errors::ApiError;
