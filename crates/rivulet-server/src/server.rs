//! Server implementation for the Rivulet Platform

use axum::Router;
use rivulet_core::{ResumeSignal, StepInterpreter};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::ServerResult;

/// Shared state behind every API handler
#[derive(Clone)]
pub struct RivuletServer {
    /// Server configuration
    config: ServerConfig,

    /// Step interpreter
    interpreter: StepInterpreter,

    /// Orchestrator resume primitive
    resume_signal: Arc<dyn ResumeSignal>,

    /// Identifiers of the in-process handlers
    built_in_modules: Vec<String>,
}

impl RivuletServer {
    /// Create a new server
    pub fn new(
        config: ServerConfig,
        interpreter: StepInterpreter,
        resume_signal: Arc<dyn ResumeSignal>,
        built_in_modules: Vec<String>,
    ) -> Self {
        Self {
            config,
            interpreter,
            resume_signal,
            built_in_modules,
        }
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Step interpreter
    pub fn interpreter(&self) -> &StepInterpreter {
        &self.interpreter
    }

    /// Orchestrator resume primitive
    pub fn resume_signal(&self) -> &dyn ResumeSignal {
        self.resume_signal.as_ref()
    }

    /// Identifiers of the in-process handlers
    pub fn built_in_modules(&self) -> &[String] {
        &self.built_in_modules
    }

    /// Router serving this server's API
    pub fn router(self) -> Router {
        crate::api::build_router(Arc::new(self))
    }

    /// Bind and serve until Ctrl-C
    pub async fn run(self) -> ServerResult<()> {
        let listener =
            TcpListener::bind((self.config.bind_address.as_str(), self.config.port)).await?;
        let addr: SocketAddr = listener.local_addr()?;
        info!("Listening on {}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("Server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
