/// Input assembly, output folding and large-value offload
pub mod data_mapper;

/// In-process handler trait and registry
pub mod handler;

/// Handler resolution and invocation
pub mod dispatcher;

/// Next-step and next-action planning
pub mod transitions;

/// Terminal failure routing
pub mod fallback;

/// Parallel fan-out and aggregation
pub mod branches;

/// Continuation lifecycle for waiting steps
pub mod suspension;

/// The step interpreter
pub mod interpreter;

pub use handler::{HandlerRegistry, StepHandler};
pub use interpreter::{InterpreterPorts, RetryableFailure, StepInterpreter};
pub use suspension::{ResumeError, SuspensionManager};
