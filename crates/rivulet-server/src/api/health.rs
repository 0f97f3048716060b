//! Health check endpoint for the Rivulet Server

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::server::RivuletServer;

/// Health check handler
pub async fn health_check(State(server): State<Arc<RivuletServer>>) -> impl IntoResponse {
    debug!("Health check requested");

    Json(json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION"),
        "builtInModules": server.built_in_modules(),
        "dependencies": {
            "orchestratorResume": if server.config().orchestrator_resume_url.is_some() { "CONFIGURED" } else { "MISSING" },
            "orchestratorStart": if server.config().orchestrator_start_url.is_some() { "CONFIGURED" } else { "MISSING" },
        },
    }))
}
