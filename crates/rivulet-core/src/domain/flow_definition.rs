use crate::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Value object: Flow definition ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(pub String);

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A versioned, immutable workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    /// ID of the flow
    pub id: FlowId,

    /// Positive version number; a new version is a new object
    pub version: u32,

    /// Whether the version has been published
    #[serde(default)]
    pub is_published: bool,

    /// Steps keyed by step instance id
    pub steps: BTreeMap<String, StepInstance>,

    /// Entry point of the flow
    pub start_step_instance_id: String,

    /// Variables merged into the context when an execution starts
    #[serde(default)]
    pub flow_variables: Map<String, Value>,

    /// Config applied beneath every step's own config
    #[serde(default)]
    pub default_step_config: Map<String, Value>,

    /// Opaque actions for the orchestrator to run on completion
    #[serde(default)]
    pub on_completion_actions: Vec<Value>,

    /// Creation timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// Last update timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// One node of the flow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInstance {
    /// Unique id within the flow
    pub step_instance_id: String,

    /// Step type and its type-specific fields
    #[serde(flatten)]
    pub kind: StepKind,

    /// Handler module, built-in or external
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_identifier: Option<String>,

    /// Static handler configuration
    #[serde(default)]
    pub custom_config: Map<String, Value>,

    /// Destination key -> source for the handler's input bag
    #[serde(default)]
    pub input_mappings: BTreeMap<String, InputMapping>,

    /// Context destination -> source within the step output
    #[serde(default)]
    pub output_mappings: BTreeMap<String, Value>,

    /// Literal inputs
    #[serde(default)]
    pub literals: Map<String, Value>,

    /// Conditional transitions, evaluated in order
    #[serde(default)]
    pub transitions: Vec<Transition>,

    /// Next step when no transition matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_next_step_instance_id: Option<String>,

    /// Error routing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnError>,
}

/// Step type, carrying only the fields relevant to that type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stepType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    /// Pass the input bag through
    NoOp,
    /// Terminate the flow successfully
    EndFlow,
    /// In-process or external business logic
    CustomLogic,
    /// External handler invocation
    ExternalInvoke,
    /// Load data through a handler
    DataLoad,
    /// Save data through a handler
    DataSave,
    /// Reshape data, optionally through a handler
    DataTransformation,
    /// Fan out to parallel branches and aggregate their results
    ParallelForkManager(ForkConfig),
    /// Suspend until an external event resumes the execution
    WaitForExternalEvent(WaitConfig),
    /// Repeatedly invoke a handler until a completion condition holds
    PollExternalApi(PollConfig),
    /// Start a child execution of another flow
    StartSubFlow(StartFlowConfig),
    /// Start an unrelated execution of another flow
    StartFlowExecution(StartFlowConfig),
    /// Entry marker for scheduled flows
    ScheduleStartPoint,
}

impl StepKind {
    /// Wire name of the step type
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::NoOp => "NO_OP",
            StepKind::EndFlow => "END_FLOW",
            StepKind::CustomLogic => "CUSTOM_LOGIC",
            StepKind::ExternalInvoke => "EXTERNAL_INVOKE",
            StepKind::DataLoad => "DATA_LOAD",
            StepKind::DataSave => "DATA_SAVE",
            StepKind::DataTransformation => "DATA_TRANSFORMATION",
            StepKind::ParallelForkManager(_) => "PARALLEL_FORK_MANAGER",
            StepKind::WaitForExternalEvent(_) => "WAIT_FOR_EXTERNAL_EVENT",
            StepKind::PollExternalApi(_) => "POLL_EXTERNAL_API",
            StepKind::StartSubFlow(_) => "START_SUB_FLOW",
            StepKind::StartFlowExecution(_) => "START_FLOW_EXECUTION",
            StepKind::ScheduleStartPoint => "SCHEDULE_START_POINT",
        }
    }
}

/// A conditional edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    /// Condition expression
    pub condition: String,
    /// Target step
    pub next_step_instance_id: String,
}

/// Error routing for a step
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnError {
    /// Step to continue with after a terminal failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_step_instance_id: Option<String>,
}

/// Source of one input-bag entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputMapping {
    /// Query path with explicit output formatting
    Source(SourceMapping),
    /// Any template or literal, rendered against the scope
    Template(Value),
}

/// Query path with output formatting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceMapping {
    /// Query expression
    pub source_path: String,
    /// How the resolved value is formatted
    #[serde(default)]
    pub format: OutputFormat,
    /// Separator for [`OutputFormat::Join`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
}

/// Formatting applied to a resolved mapping source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputFormat {
    /// Pass the value through unchanged
    #[default]
    Raw,
    /// Join an array into a string
    Join,
}

/// Fork step fields
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkConfig {
    /// Branches in input order
    #[serde(default)]
    pub parallel_branches: Vec<ParallelBranch>,
    /// How branch results are merged
    #[serde(default)]
    pub aggregation_config: AggregationConfig,
    /// Upper bound on simultaneously running branches; 0 or absent is unbounded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
}

/// One branch of a fork step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelBranch {
    /// Branch id, unique within the fork
    pub branch_id: String,
    /// What the branch runs
    pub target: BranchTarget,
    /// Branch input, evaluated against the fork step's scope
    #[serde(default)]
    pub input_mappings: BTreeMap<String, InputMapping>,
    /// Literal branch inputs
    #[serde(default)]
    pub literals: Map<String, Value>,
    /// Optional gate; the branch is skipped when false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Entry point of a branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BranchTarget {
    /// Another step instance in the same flow
    StepRef {
        /// Referenced step
        #[serde(rename = "stepInstanceId")]
        step_instance_id: String,
    },
    /// The start of another flow
    SubFlow {
        /// Flow to start
        #[serde(rename = "flowDefinitionId")]
        flow_definition_id: FlowId,
        /// Version to start
        version: u32,
    },
}

/// Aggregation policy for a fork step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationConfig {
    /// Merge strategy
    #[serde(default)]
    pub strategy: AggregationStrategy,
    /// Projection path for [`AggregationStrategy::CollectDataPath`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_path: Option<String>,
    /// Module for [`AggregationStrategy::CustomModule`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_identifier: Option<String>,
    /// Fail the step on any branch failure
    #[serde(default = "default_true")]
    pub fail_on_branch_error: bool,
    /// Percentage of failed branches that is still a success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerated_failure_percentage: Option<f64>,
}

fn default_true() -> bool {
    true
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            strategy: AggregationStrategy::default(),
            data_path: None,
            module_identifier: None,
            fail_on_branch_error: true,
            tolerated_failure_percentage: None,
        }
    }
}

/// Merge strategy for branch outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregationStrategy {
    /// One entry per successful branch, in input order
    #[default]
    CollectArray,
    /// Like `CollectArray`, projecting each output through `dataPath`
    CollectDataPath,
    /// Delegate to a named aggregation module
    CustomModule,
}

/// Wait step fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitConfig {
    /// Template rendered into the correlation key
    pub correlation_key_template: String,
    /// Continuation TTL override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_wait_time_seconds: Option<u64>,
}

/// Poll step fields
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollConfig {
    /// Polling schedule handed to the orchestrator
    #[serde(default)]
    pub polling_config: PollingConfig,
}

/// Polling schedule and completion test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingConfig {
    /// Delay between attempts
    #[serde(default = "default_poll_interval")]
    pub interval_seconds: u64,
    /// Attempts before the step fails
    #[serde(default = "default_poll_attempts")]
    pub max_attempts: u32,
    /// Condition over `$.pollResult`; absent means the first success completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_condition: Option<String>,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_poll_attempts() -> u32 {
    10
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_poll_interval(),
            max_attempts: default_poll_attempts(),
            completion_condition: None,
        }
    }
}

/// Fields for steps that start other executions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartFlowConfig {
    /// Flow to start
    pub target_flow_definition_id: FlowId,
    /// Version to start
    pub target_flow_version: u32,
    /// Free-form trigger label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_source: Option<String>,
}

impl FlowDefinition {
    /// Look up a step by id
    pub fn step(&self, step_instance_id: &str) -> Option<&StepInstance> {
        self.steps.get(step_instance_id)
    }

    /// Validate the flow definition.
    ///
    /// Run at publish/create time; the interpreter assumes a validated
    /// definition. All problems are reported in one error.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut problems = Vec::new();

        if self.version == 0 {
            problems.push("version must be positive".to_string());
        }

        if self.steps.is_empty() {
            problems.push("flow must have at least one step".to_string());
        }

        for (key, step) in &self.steps {
            if key != &step.step_instance_id {
                problems.push(format!(
                    "step key '{}' does not match stepInstanceId '{}'",
                    key, step.step_instance_id
                ));
            }
        }

        if !self.steps.contains_key(&self.start_step_instance_id) {
            problems.push(format!(
                "startStepInstanceId references unknown step: {}",
                self.start_step_instance_id
            ));
        }

        for step in self.steps.values() {
            for target in step.referenced_steps() {
                if !self.steps.contains_key(target) {
                    problems.push(format!(
                        "step {} references unknown step: {}",
                        step.step_instance_id, target
                    ));
                }
            }

            if let StepKind::ParallelForkManager(fork) = &step.kind {
                let mut branch_ids = BTreeSet::new();
                for branch in &fork.parallel_branches {
                    if !branch_ids.insert(branch.branch_id.as_str()) {
                        problems.push(format!(
                            "step {} has duplicate branch id: {}",
                            step.step_instance_id, branch.branch_id
                        ));
                    }
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(CoreError::ValidationError(format!(
                "flow {} v{}: {}",
                self.id,
                self.version,
                problems.join("; ")
            )))
        }
    }
}

impl StepInstance {
    /// Every step id this step can route to
    pub fn referenced_steps(&self) -> Vec<&str> {
        let mut targets: Vec<&str> = self
            .transitions
            .iter()
            .map(|t| t.next_step_instance_id.as_str())
            .collect();

        if let Some(next) = &self.default_next_step_instance_id {
            targets.push(next);
        }

        if let Some(fallback) = self
            .on_error
            .as_ref()
            .and_then(|e| e.fallback_step_instance_id.as_deref())
        {
            targets.push(fallback);
        }

        if let StepKind::ParallelForkManager(fork) = &self.kind {
            for branch in &fork.parallel_branches {
                if let BranchTarget::StepRef { step_instance_id } = &branch.target {
                    targets.push(step_instance_id);
                }
            }
        }

        targets
    }

    /// Fallback step configured for terminal failures
    pub fn fallback_step(&self) -> Option<&str> {
        self.on_error
            .as_ref()
            .and_then(|e| e.fallback_step_instance_id.as_deref())
    }
}
