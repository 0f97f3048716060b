//!
//! Rivulet Server - HTTP adapter for the Rivulet step interpreter
//!
//! Exposes the orchestrator contract (`start`, `execute`, `suspend`,
//! `resume-step`, `aggregate`, `retries-exhausted`) and the public resume
//! endpoint, and wires the interpreter to its object store, metadata,
//! continuation store and orchestrator clients.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use rivulet_content_store::{FileObjectStore, HttpObjectStore};
use rivulet_core::domain::repository::memory::{MemoryContinuationStore, MemoryObjectStore};
use rivulet_core::{InterpreterPorts, ObjectStore, StepInterpreter};

/// API module
pub mod api;

/// Configuration module
pub mod config;

/// Error module
pub mod error;

/// Flow definition loading
pub mod flows;

/// Orchestrator clients
pub mod orchestrator;

/// External handler RPC
pub mod rpc;

/// Server module
pub mod server;

// Re-export key types
pub use config::{LogFormat, ServerConfig};
pub use error::{ServerError, ServerResult};
pub use server::RivuletServer;

use crate::orchestrator::{HttpFlowStartQueue, HttpResumeSignal};
use crate::rpc::HttpHandlerInvoker;

/// Timeout for calls to the orchestrator
const ORCHESTRATOR_TIMEOUT: Duration = Duration::from_secs(10);

/// Initialize logging
pub fn init_logging(config: &ServerConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let result = match config.log_format {
        LogFormat::Json => fmt().json().with_env_filter(filter).with_target(true).try_init(),
        LogFormat::Text => fmt().with_env_filter(filter).with_target(true).try_init(),
    };
    if result.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
}

/// Create the object store selected by the configuration
fn create_object_store(config: &ServerConfig) -> ServerResult<Arc<dyn ObjectStore>> {
    if let Some(url) = &config.object_store_url {
        info!(url = %url, "Using HTTP object store");
        let mut store = HttpObjectStore::new(url.clone(), Duration::from_secs(config.handler_timeout_seconds))?;
        if let Some(token) = &config.object_store_token {
            store = store.with_api_token(token.clone());
        }
        return Ok(Arc::new(store));
    }

    if let Some(dir) = &config.object_store_dir {
        info!(dir = %dir, "Using filesystem object store");
        return Ok(Arc::new(FileObjectStore::new(dir)));
    }

    tracing::warn!("No object store configured - offloaded values live in memory only");
    Ok(Arc::new(MemoryObjectStore::new()))
}

/// Wire a server from its configuration
pub async fn build_server(config: ServerConfig) -> ServerResult<RivuletServer> {
    let metadata = flows::load_metadata(config.flows_dir.as_deref(), config.handlers_file.as_deref()).await?;
    let object_store = create_object_store(&config)?;
    let flow_starts = HttpFlowStartQueue::new(config.orchestrator_start_url.clone(), ORCHESTRATOR_TIMEOUT)?;
    let resume_signal = HttpResumeSignal::new(config.orchestrator_resume_url.clone(), ORCHESTRATOR_TIMEOUT)?;
    let invoker = HttpHandlerInvoker::new(Duration::from_secs(config.handler_timeout_seconds))?;

    let registry = rivulet_stdlib::registry();
    let built_in_modules = registry.module_identifiers();

    let interpreter = StepInterpreter::new(
        config.interpreter.clone(),
        Arc::new(registry),
        InterpreterPorts {
            object_store,
            metadata: Arc::new(metadata),
            continuations: Arc::new(MemoryContinuationStore::new()),
            flow_starts: Arc::new(flow_starts),
            invoker: Some(Arc::new(invoker)),
        },
    );

    Ok(RivuletServer::new(
        config,
        interpreter,
        Arc::new(resume_signal),
        built_in_modules,
    ))
}

/// Run function
pub async fn run(config: ServerConfig) -> ServerResult<()> {
    let server = build_server(config).await?;
    server.run().await
}
