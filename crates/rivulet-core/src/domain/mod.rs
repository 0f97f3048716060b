/// Flow definition domain models
pub mod flow_definition;

/// Execution snapshot and orchestrator actions
pub mod execution_state;

/// Parallel branch payloads and results
pub mod branch;

/// Continuation records for suspended executions
pub mod continuation;

/// Ports to external stores and services
pub mod repository;
