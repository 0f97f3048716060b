use crate::domain::flow_definition::{AggregationConfig, FlowId, PollingConfig};
use crate::domain::branch::BranchPayload;
use crate::ErrorInfo;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Created, no step executed yet
    Initializing,
    /// Steps are being executed
    Running,
    /// Finished successfully
    Completed,
    /// Finished with a terminal failure
    Failed,
    /// Stopped by the orchestrator's timeout
    TimedOut,
    /// Stopped by the orchestrator
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal states are absorbing
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::TimedOut
                | ExecutionStatus::Cancelled
        )
    }
}

/// The snapshot passed in and out of every interpreter invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    /// Execution id
    pub flow_execution_id: String,

    /// Flow definition being executed
    pub flow_definition_id: FlowId,

    /// Flow definition version
    pub version: u32,

    /// Step to execute next; absent in terminal states
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step_instance_id: Option<String>,

    /// Current status
    pub status: ExecutionStatus,

    /// Working set, mutated only by output mappings
    #[serde(default)]
    pub current_context_data: Map<String, Value>,

    /// Attempts per step instance
    #[serde(default)]
    pub step_retry_attempts: BTreeMap<String, u32>,

    /// Last failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,

    /// Branch id when this is a parallel sub-execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,

    /// Branch execution id when this is a parallel sub-execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_execution_id: Option<String>,

    /// Execution that started this one, for branches and sub-flows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<String>,
}

impl ExecutionState {
    /// Create a fresh, initializing execution
    pub fn new(flow_execution_id: impl Into<String>, flow_definition_id: FlowId, version: u32) -> Self {
        Self {
            flow_execution_id: flow_execution_id.into(),
            flow_definition_id,
            version,
            current_step_instance_id: None,
            status: ExecutionStatus::Initializing,
            current_context_data: Map::new(),
            step_retry_attempts: BTreeMap::new(),
            error_info: None,
            branch_id: None,
            branch_execution_id: None,
            parent_execution_id: None,
        }
    }

    /// Set the initial context
    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.current_context_data = context;
        self
    }

    /// Whether no further steps may run
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The view every step-level expression is evaluated against: the
    /// state's own fields with the context data laid over them.
    pub fn scope(&self) -> Value {
        let mut scope = Map::new();
        scope.insert("flowExecutionId".to_string(), json!(self.flow_execution_id));
        scope.insert("flowDefinitionId".to_string(), json!(self.flow_definition_id.0));
        scope.insert("version".to_string(), json!(self.version));
        scope.insert("status".to_string(), json!(self.status));
        if let Some(step) = &self.current_step_instance_id {
            scope.insert("currentStepInstanceId".to_string(), json!(step));
        }
        scope.insert("stepRetryAttempts".to_string(), json!(self.step_retry_attempts));
        if let Some(error) = &self.error_info {
            scope.insert("errorInfo".to_string(), json!(error));
        }
        if let Some(branch) = &self.branch_id {
            scope.insert("branchId".to_string(), json!(branch));
        }
        if let Some(branch_execution) = &self.branch_execution_id {
            scope.insert("branchExecutionId".to_string(), json!(branch_execution));
        }
        if let Some(parent) = &self.parent_execution_id {
            scope.insert("parentExecutionId".to_string(), json!(parent));
        }
        scope.insert(
            "currentContextData".to_string(),
            Value::Object(self.current_context_data.clone()),
        );
        for (key, value) in &self.current_context_data {
            scope.insert(key.clone(), value.clone());
        }
        Value::Object(scope)
    }

    /// Attempts recorded for a step
    pub fn attempts(&self, step_instance_id: &str) -> u32 {
        self.step_retry_attempts
            .get(step_instance_id)
            .copied()
            .unwrap_or(0)
    }

    /// Record another attempt and return the new count
    pub fn increment_attempts(&mut self, step_instance_id: &str) -> u32 {
        let count = self
            .step_retry_attempts
            .entry(step_instance_id.to_string())
            .or_insert(0);
        *count += 1;
        *count
    }

    /// Forget the attempts of a step
    pub fn reset_attempts(&mut self, step_instance_id: &str) {
        self.step_retry_attempts.remove(step_instance_id);
    }
}

/// Request to start a new execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStartMessage {
    /// Flow to start
    pub flow_definition_id: FlowId,
    /// Version to start
    pub flow_version: u32,
    /// Initial working set
    #[serde(default)]
    pub initial_context_data: Map<String, Value>,
    /// Caller-chosen execution id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_execution_id: Option<String>,
    /// Free-form trigger label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_source: Option<String>,
    /// Starting execution, for sub-flows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<String>,
}

/// What the orchestrator must do after an invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NextAction {
    /// Invoke again with the returned state
    Continue,
    /// Wait for an external event; call back with a resume token
    Suspend,
    /// Invoke again after the polling interval
    Poll {
        /// Polling schedule of the step to run
        #[serde(rename = "pollingConfig")]
        polling_config: PollingConfig,
    },
    /// Run the branches, then hand their results back for aggregation
    Fork {
        /// One payload per qualifying branch
        branches: Vec<BranchPayload>,
        /// Aggregation policy
        #[serde(rename = "aggregationConfig")]
        aggregation_config: AggregationConfig,
        /// Concurrency bound; absent is unbounded
        #[serde(rename = "maxConcurrency", default, skip_serializing_if = "Option::is_none")]
        max_concurrency: Option<u32>,
    },
    /// The execution is finished
    Finalize,
}

/// Output of one interpreter invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    /// State to persist and pass to the next call
    pub state: ExecutionState,
    /// Action for the orchestrator
    pub action: NextAction,
}

impl StepResult {
    /// Pair a state with an action
    pub fn new(state: ExecutionState, action: NextAction) -> Self {
        Self { state, action }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> ExecutionState {
        let mut context = Map::new();
        context.insert("amount".to_string(), json!(150));
        context.insert("status".to_string(), json!("shadowed"));
        ExecutionState::new("exec-1", FlowId("orders".to_string()), 2).with_context(context)
    }

    #[test]
    fn test_scope_overlays_context() {
        let scope = state().scope();
        assert_eq!(scope["amount"], json!(150));
        assert_eq!(scope["status"], json!("shadowed"));
        assert_eq!(scope["flowExecutionId"], json!("exec-1"));
        assert_eq!(scope["currentContextData"]["amount"], json!(150));
        assert!(scope.get("currentStepInstanceId").is_none());
    }

    #[test]
    fn test_attempt_counters() {
        let mut state = state();
        assert_eq!(state.attempts("a"), 0);
        assert_eq!(state.increment_attempts("a"), 1);
        assert_eq!(state.increment_attempts("a"), 2);
        state.reset_attempts("a");
        assert_eq!(state.attempts("a"), 0);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!ExecutionStatus::Initializing.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::TimedOut.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_state_wire_shape() {
        let mut state = state();
        state.status = ExecutionStatus::TimedOut;
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["status"], "TIMED_OUT");
        assert_eq!(value["flowDefinitionId"], "orders");
        assert!(value.get("currentStepInstanceId").is_none());

        let back: ExecutionState = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_action_wire_shape() {
        let poll = NextAction::Poll {
            polling_config: PollingConfig::default(),
        };
        let value = serde_json::to_value(&poll).unwrap();
        assert_eq!(value["type"], "POLL");
        assert_eq!(value["pollingConfig"]["intervalSeconds"], 30);
        assert_eq!(serde_json::to_value(&NextAction::Finalize).unwrap(), json!({"type": "FINALIZE"}));
    }
}
