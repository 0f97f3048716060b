//!
//! Rivulet Core - the step interpreter of the Rivulet workflow platform
//!
//! This crate defines the flow and execution models, the query, template
//! and condition machinery, and the stateless [`StepInterpreter`] that an
//! external orchestrator drives one step at a time. Stores and services
//! are reached through the ports in [`domain::repository`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - flow definitions, execution state and ports
pub mod domain;

/// Query resolution, template rendering and condition evaluation
pub mod expression;

/// Application services - the interpreter and its components
pub mod application;

/// Core types
pub mod types;

/// Error types
pub mod error;

/// Interpreter configuration
pub mod config;

// Re-export key types
pub use config::InterpreterConfig;
pub use error::{CoreError, ErrorInfo, StepError};
pub use types::{LargeValuePointer, ObjectStoreRef, Resolved};

// Re-export main API types for easy use
pub use application::{
    HandlerRegistry, InterpreterPorts, ResumeError, RetryableFailure, StepHandler, StepInterpreter,
    SuspensionManager,
};
pub use domain::branch::{BranchPayload, BranchResult};
pub use domain::continuation::ContinuationRecord;
pub use domain::execution_state::{
    ExecutionState, ExecutionStatus, FlowStartMessage, NextAction, StepResult,
};
pub use domain::flow_definition::{FlowDefinition, FlowId, StepInstance, StepKind};
pub use domain::repository::{
    ContinuationStore, FlowStartQueue, HandlerInvoker, HandlerRegistration, HandlerRequest,
    InvocationError, MetadataStore, ObjectStore, ResumeSignal, SignalError,
};
