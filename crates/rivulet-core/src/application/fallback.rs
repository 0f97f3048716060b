use super::transitions::TransitionResolver;
use crate::domain::execution_state::{ExecutionState, ExecutionStatus, NextAction, StepResult};
use crate::domain::flow_definition::FlowDefinition;
use crate::ErrorInfo;
use tracing::{error, warn};

/// Route a terminal failure at `failed_step`.
///
/// The error is recorded on the state. With a fallback step the execution
/// keeps running there; without one it fails.
pub fn handle_terminal_failure(
    flow: Option<&FlowDefinition>,
    mut state: ExecutionState,
    failed_step: Option<&str>,
    error_info: ErrorInfo,
) -> StepResult {
    let fallback = flow.zip(failed_step).and_then(|(flow, step_id)| {
        let fallback = flow.step(step_id)?.fallback_step()?;
        match TransitionResolver::action_for(flow, Some(fallback)) {
            Ok(action) => Some((fallback.to_string(), action)),
            Err(e) => {
                warn!(step_id = %step_id, fallback = %fallback, error = %e, "Fallback step is unusable");
                None
            }
        }
    });

    if let Some(step_id) = failed_step {
        state.reset_attempts(step_id);
    }

    match fallback {
        Some((fallback, action)) => {
            warn!(
                flow_execution_id = %state.flow_execution_id,
                step_id = ?failed_step,
                fallback = %fallback,
                error_name = %error_info.error_name,
                "Step failed, routing to fallback"
            );
            state.error_info = Some(error_info);
            state.status = ExecutionStatus::Running;
            state.current_step_instance_id = Some(fallback);
            StepResult::new(state, action)
        }
        None => {
            error!(
                flow_execution_id = %state.flow_execution_id,
                step_id = ?failed_step,
                error_name = %error_info.error_name,
                error_message = %error_info.error_message,
                "Execution failed"
            );
            state.error_info = Some(error_info);
            state.status = ExecutionStatus::Failed;
            state.current_step_instance_id = None;
            StepResult::new(state, NextAction::Finalize)
        }
    }
}
