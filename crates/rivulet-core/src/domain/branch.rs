use crate::domain::execution_state::{ExecutionState, ExecutionStatus};
use crate::domain::flow_definition::BranchTarget;
use crate::ErrorInfo;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Fan-out payload for one branch of a fork step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchPayload {
    /// Branch id from the fork step
    pub branch_id: String,
    /// Position in the fork step's branch list
    pub branch_index: usize,
    /// `<parentExecutionId>:<branchId>`
    pub branch_execution_id: String,
    /// What the branch runs
    pub target: BranchTarget,
    /// Input evaluated against the fork step's scope
    #[serde(default)]
    pub input_data: Map<String, Value>,
}

impl BranchPayload {
    /// Derive the branch execution id
    pub fn branch_execution_id(parent_execution_id: &str, branch_id: &str) -> String {
        format!("{}:{}", parent_execution_id, branch_id)
    }

    /// Build the initial state of the branch sub-execution.
    ///
    /// A step reference continues inside the parent's flow with the parent's
    /// context plus the branch input. A sub-flow starts from scratch with the
    /// branch input as its whole context.
    pub fn to_execution_state(&self, parent: &ExecutionState) -> ExecutionState {
        let mut state = match &self.target {
            BranchTarget::StepRef { step_instance_id } => {
                let mut context = parent.current_context_data.clone();
                for (key, value) in &self.input_data {
                    context.insert(key.clone(), value.clone());
                }
                let mut state = ExecutionState::new(
                    self.branch_execution_id.clone(),
                    parent.flow_definition_id.clone(),
                    parent.version,
                )
                .with_context(context);
                state.status = ExecutionStatus::Running;
                state.current_step_instance_id = Some(step_instance_id.clone());
                state
            }
            BranchTarget::SubFlow {
                flow_definition_id,
                version,
            } => ExecutionState::new(
                self.branch_execution_id.clone(),
                flow_definition_id.clone(),
                *version,
            )
            .with_context(self.input_data.clone()),
        };

        state.branch_id = Some(self.branch_id.clone());
        state.branch_execution_id = Some(self.branch_execution_id.clone());
        state.parent_execution_id = Some(parent.flow_execution_id.clone());
        state.step_retry_attempts = BTreeMap::new();
        state
    }
}

/// Outcome of one branch, handed back for aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchResult {
    /// Branch id
    pub branch_id: String,
    /// Position in the fork step's branch list
    pub branch_index: usize,
    /// Whether the branch completed
    pub succeeded: bool,
    /// Branch output when it succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Branch failure when it did not
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl BranchResult {
    /// Successful branch
    pub fn success(branch_id: impl Into<String>, branch_index: usize, output: Value) -> Self {
        Self {
            branch_id: branch_id.into(),
            branch_index,
            succeeded: true,
            output: Some(output),
            error: None,
        }
    }

    /// Failed branch
    pub fn failure(branch_id: impl Into<String>, branch_index: usize, error: ErrorInfo) -> Self {
        Self {
            branch_id: branch_id.into(),
            branch_index,
            succeeded: false,
            output: None,
            error: Some(error),
        }
    }

    /// Summarise a branch sub-execution that reached a terminal state
    pub fn from_final_state(payload: &BranchPayload, state: &ExecutionState) -> Self {
        if state.status == ExecutionStatus::Completed {
            Self::success(
                payload.branch_id.clone(),
                payload.branch_index,
                Value::Object(state.current_context_data.clone()),
            )
        } else {
            let error = state.error_info.clone().unwrap_or_else(|| {
                ErrorInfo::terminal(
                    "BranchExecutionError",
                    format!("branch ended with status {:?}", state.status),
                )
            });
            Self::failure(payload.branch_id.clone(), payload.branch_index, error)
        }
    }
}
