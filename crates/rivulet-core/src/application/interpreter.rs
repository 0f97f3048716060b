//! The step interpreter
//!
//! Every entry point takes an [`ExecutionState`], runs at most one step and
//! hands back the new state plus the action the orchestrator must take. The
//! interpreter keeps nothing between calls; the orchestrator persists the
//! returned state and passes it back unmodified.

use super::branches::BranchOrchestrator;
use super::data_mapper::DataMapper;
use super::dispatcher::StepDispatcher;
use super::fallback::handle_terminal_failure;
use super::handler::HandlerRegistry;
use super::suspension::SuspensionManager;
use super::transitions::TransitionResolver;
use crate::config::InterpreterConfig;
use crate::domain::branch::BranchResult;
use crate::domain::execution_state::{
    ExecutionState, ExecutionStatus, FlowStartMessage, NextAction, StepResult,
};
use crate::domain::flow_definition::{FlowDefinition, PollingConfig, StartFlowConfig, StepInstance, StepKind};
use crate::domain::repository::{
    ContinuationStore, FlowStartQueue, HandlerInvoker, MetadataStore, ObjectStore,
};
use crate::expression::{ConditionEvaluator, TemplateRenderer, ValueResolver};
use crate::{CoreError, ErrorInfo, StepError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A retryable step failure within the retry budget.
///
/// `state` carries the incremented attempt counter; the orchestrator
/// persists it and re-invokes after its backoff.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{}: {}", .error.error_name, .error.error_message)]
pub struct RetryableFailure {
    /// State to retry with
    pub state: ExecutionState,
    /// The failure
    pub error: ErrorInfo,
}

/// External collaborators of the interpreter
#[derive(Clone)]
pub struct InterpreterPorts {
    /// Large-value storage
    pub object_store: Arc<dyn ObjectStore>,
    /// Flow definitions and handler registrations
    pub metadata: Arc<dyn MetadataStore>,
    /// Continuation records of waiting executions
    pub continuations: Arc<dyn ContinuationStore>,
    /// Start requests for new executions
    pub flow_starts: Arc<dyn FlowStartQueue>,
    /// RPC client for external handlers; without one only built-ins run
    pub invoker: Option<Arc<dyn HandlerInvoker>>,
}

enum Prepared {
    Done(StepResult),
    Ready {
        flow: FlowDefinition,
        step: StepInstance,
        state: ExecutionState,
    },
}

/// Stateless step-at-a-time workflow interpreter
#[derive(Clone)]
pub struct StepInterpreter {
    config: InterpreterConfig,
    metadata: Arc<dyn MetadataStore>,
    flow_starts: Arc<dyn FlowStartQueue>,
    mapper: DataMapper,
    evaluator: ConditionEvaluator,
    dispatcher: StepDispatcher,
    transitions: TransitionResolver,
    branches: BranchOrchestrator,
    suspension: SuspensionManager,
}

impl StepInterpreter {
    /// Wire an interpreter from its configuration, handlers and ports
    pub fn new(config: InterpreterConfig, registry: Arc<HandlerRegistry>, ports: InterpreterPorts) -> Self {
        let resolver = ValueResolver::new(ports.object_store.clone());
        let renderer = TemplateRenderer::new(resolver.clone(), config.max_template_depth);
        let evaluator = ConditionEvaluator::new(resolver);
        let mapper = DataMapper::new(renderer.clone(), ports.object_store, &config);

        Self {
            dispatcher: StepDispatcher::new(registry.clone(), ports.metadata.clone(), ports.invoker),
            transitions: TransitionResolver::new(evaluator.clone()),
            branches: BranchOrchestrator::new(mapper.clone(), evaluator.clone(), registry),
            suspension: SuspensionManager::new(renderer, ports.continuations, &config),
            metadata: ports.metadata,
            flow_starts: ports.flow_starts,
            mapper,
            evaluator,
            config,
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    /// Suspension manager, shared with the resume endpoint
    pub fn suspension(&self) -> &SuspensionManager {
        &self.suspension
    }

    /// Build the initial state of a new execution
    pub async fn start(&self, message: FlowStartMessage) -> Result<StepResult, CoreError> {
        let flow = self
            .metadata
            .get_flow_definition(&message.flow_definition_id, message.flow_version)
            .await?
            .ok_or_else(|| {
                CoreError::FlowDefinitionNotFound(format!(
                    "{} v{}",
                    message.flow_definition_id, message.flow_version
                ))
            })?;

        let flow_execution_id = message
            .flow_execution_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut state = ExecutionState::new(flow_execution_id, message.flow_definition_id, message.flow_version)
            .with_context(message.initial_context_data);
        state.parent_execution_id = message.parent_execution_id;
        state.current_step_instance_id = Some(flow.start_step_instance_id.clone());

        info!(
            flow_execution_id = %state.flow_execution_id,
            flow_id = %flow.id,
            version = flow.version,
            trigger_source = ?message.trigger_source,
            "Execution created"
        );
        Ok(StepResult::new(state, NextAction::Continue))
    }

    /// Run the current step
    pub async fn execute(&self, state: ExecutionState) -> Result<StepResult, RetryableFailure> {
        let (flow, step, state) = match self.prepare(state).await? {
            Prepared::Done(result) => return Ok(result),
            Prepared::Ready { flow, step, state } => (flow, step, state),
        };

        debug!(
            flow_execution_id = %state.flow_execution_id,
            step_id = %step.step_instance_id,
            step_type = step.kind.type_name(),
            "Executing step"
        );
        let outcome = self.run_step(&flow, &step, state.clone()).await;
        self.settle(&flow, &step, state, outcome)
    }

    /// Save the continuation of the waiting step under `resume_token`
    pub async fn suspend(&self, state: ExecutionState, resume_token: &str) -> Result<StepResult, RetryableFailure> {
        let (flow, step, state) = match self.prepare(state).await? {
            Prepared::Done(result) => return Ok(result),
            Prepared::Ready { flow, step, state } => (flow, step, state),
        };
        let StepKind::WaitForExternalEvent(wait) = &step.kind else {
            return Ok(self.wrong_step_kind(&flow, &step, state, "WAIT_FOR_EXTERNAL_EVENT"));
        };

        let outcome = self
            .suspension
            .suspend(&state, &step.step_instance_id, wait, resume_token)
            .await
            .map(|_| StepResult::new(state.clone(), NextAction::Suspend));
        self.settle(&flow, &step, state, outcome)
    }

    /// Complete the waiting step with the event payload as its output
    pub async fn resume_with_event(
        &self,
        state: ExecutionState,
        payload: Value,
    ) -> Result<StepResult, RetryableFailure> {
        let (flow, step, state) = match self.prepare(state).await? {
            Prepared::Done(result) => return Ok(result),
            Prepared::Ready { flow, step, state } => (flow, step, state),
        };
        if !matches!(step.kind, StepKind::WaitForExternalEvent(_)) {
            return Ok(self.wrong_step_kind(&flow, &step, state, "WAIT_FOR_EXTERNAL_EVENT"));
        }

        info!(
            flow_execution_id = %state.flow_execution_id,
            step_id = %step.step_instance_id,
            "Resuming with external event"
        );
        let outcome = self.complete_step(&flow, &step, state.clone(), payload).await;
        self.settle(&flow, &step, state, outcome)
    }

    /// Merge branch results into the fork step's output and move on
    pub async fn aggregate(
        &self,
        state: ExecutionState,
        results: Vec<BranchResult>,
    ) -> Result<StepResult, RetryableFailure> {
        let (flow, step, state) = match self.prepare(state).await? {
            Prepared::Done(result) => return Ok(result),
            Prepared::Ready { flow, step, state } => (flow, step, state),
        };
        let StepKind::ParallelForkManager(fork) = &step.kind else {
            return Ok(self.wrong_step_kind(&flow, &step, state, "PARALLEL_FORK_MANAGER"));
        };

        info!(
            flow_execution_id = %state.flow_execution_id,
            step_id = %step.step_instance_id,
            results = results.len(),
            "Aggregating branch results"
        );
        let outcome = async {
            let output = self
                .branches
                .aggregate(&fork.aggregation_config, results, &step, &state)
                .await?;
            self.complete_step(&flow, &step, state.clone(), output).await
        }
        .await;
        self.settle(&flow, &step, state, outcome)
    }

    /// Treat `error` as terminal for the current step, e.g. once the
    /// orchestrator has given up retrying it.
    pub async fn retries_exhausted(
        &self,
        state: ExecutionState,
        error: ErrorInfo,
    ) -> Result<StepResult, RetryableFailure> {
        let (flow, step, state) = match self.prepare(state).await? {
            Prepared::Done(result) => return Ok(result),
            Prepared::Ready { flow, step, state } => (flow, step, state),
        };
        error!(
            flow_execution_id = %state.flow_execution_id,
            step_id = %step.step_instance_id,
            error_name = %error.error_name,
            "Retries exhausted"
        );
        Ok(fail_step(Some(&flow), state, &step.step_instance_id, error))
    }

    /// Load the flow, activate a new execution and locate the current step
    async fn prepare(&self, mut state: ExecutionState) -> Result<Prepared, RetryableFailure> {
        if state.is_terminal() {
            debug!(flow_execution_id = %state.flow_execution_id, status = ?state.status, "Execution already finished");
            return Ok(Prepared::Done(StepResult::new(state, NextAction::Finalize)));
        }

        let loaded = self
            .metadata
            .get_flow_definition(&state.flow_definition_id, state.version)
            .await;
        let flow = match loaded {
            Ok(Some(flow)) => flow,
            Ok(None) => {
                let info = ErrorInfo::terminal(
                    "FlowDefinitionNotFound",
                    format!("{} v{}", state.flow_definition_id, state.version),
                );
                let step_id = state.current_step_instance_id.clone();
                return Ok(Prepared::Done(handle_terminal_failure(None, state, step_id.as_deref(), info)));
            }
            Err(e) => {
                let error = StepError::from(e);
                if error.is_retryable() {
                    warn!(flow_execution_id = %state.flow_execution_id, error = %error, "Flow definition lookup failed");
                    return Err(RetryableFailure {
                        state,
                        error: error.to_error_info(),
                    });
                }
                let step_id = state.current_step_instance_id.clone();
                return Ok(Prepared::Done(handle_terminal_failure(
                    None,
                    state,
                    step_id.as_deref(),
                    error.to_error_info(),
                )));
            }
        };

        if state.status == ExecutionStatus::Initializing {
            for (key, value) in &flow.flow_variables {
                state
                    .current_context_data
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
            state.status = ExecutionStatus::Running;
            if state.current_step_instance_id.is_none() {
                state.current_step_instance_id = Some(flow.start_step_instance_id.clone());
            }
            info!(flow_execution_id = %state.flow_execution_id, flow_id = %flow.id, "Execution started");
        }

        let Some(step_id) = state.current_step_instance_id.clone() else {
            state.status = ExecutionStatus::Completed;
            return Ok(Prepared::Done(StepResult::new(state, NextAction::Finalize)));
        };

        let Some(step) = flow.step(&step_id).cloned() else {
            let info = ErrorInfo::terminal("StepNotFound", CoreError::StepNotFound(step_id.clone()).to_string());
            return Ok(Prepared::Done(handle_terminal_failure(Some(&flow), state, Some(&step_id), info)));
        };

        Ok(Prepared::Ready { flow, step, state })
    }

    async fn run_step(
        &self,
        flow: &FlowDefinition,
        step: &StepInstance,
        mut state: ExecutionState,
    ) -> Result<StepResult, StepError> {
        match &step.kind {
            StepKind::EndFlow => {
                let input = self.resolve_input(flow, step, &state).await?;
                self.mapper
                    .apply_output(&mut state, &step.output_mappings, &Value::Object(input))
                    .await?;
                state.reset_attempts(&step.step_instance_id);
                state.error_info = None;
                state.status = ExecutionStatus::Completed;
                state.current_step_instance_id = None;
                info!(flow_execution_id = %state.flow_execution_id, step_id = %step.step_instance_id, "Execution completed");
                Ok(StepResult::new(state, NextAction::Finalize))
            }
            StepKind::WaitForExternalEvent(_) => Ok(StepResult::new(state, NextAction::Suspend)),
            StepKind::ParallelForkManager(fork) => {
                let branches = self.branches.fan_out(fork, &state).await?;
                if branches.is_empty() {
                    let output = self
                        .branches
                        .aggregate(&fork.aggregation_config, Vec::new(), step, &state)
                        .await?;
                    return self.complete_step(flow, step, state, output).await;
                }
                Ok(StepResult::new(
                    state,
                    NextAction::Fork {
                        branches,
                        aggregation_config: fork.aggregation_config.clone(),
                        max_concurrency: fork.max_concurrency.filter(|n| *n > 0),
                    },
                ))
            }
            StepKind::StartSubFlow(target) => self.start_flow(flow, step, state, target, true).await,
            StepKind::StartFlowExecution(target) => self.start_flow(flow, step, state, target, false).await,
            StepKind::PollExternalApi(poll) => self.poll(flow, step, state, &poll.polling_config).await,
            StepKind::NoOp | StepKind::ScheduleStartPoint => {
                let input = self.resolve_input(flow, step, &state).await?;
                self.complete_step(flow, step, state, Value::Object(input)).await
            }
            StepKind::DataTransformation if step.module_identifier.is_none() => {
                let input = self.resolve_input(flow, step, &state).await?;
                self.complete_step(flow, step, state, Value::Object(input)).await
            }
            _ => {
                let input = self.resolve_input(flow, step, &state).await?;
                let output = self.dispatcher.dispatch(step, input, &state).await?;
                self.complete_step(flow, step, state, output).await
            }
        }
    }

    async fn resolve_input(
        &self,
        flow: &FlowDefinition,
        step: &StepInstance,
        state: &ExecutionState,
    ) -> Result<serde_json::Map<String, Value>, CoreError> {
        self.mapper
            .resolve_input(step, &flow.default_step_config, &state.scope())
            .await
    }

    async fn start_flow(
        &self,
        flow: &FlowDefinition,
        step: &StepInstance,
        state: ExecutionState,
        target: &StartFlowConfig,
        sub_flow: bool,
    ) -> Result<StepResult, StepError> {
        let input = self.resolve_input(flow, step, &state).await?;
        let flow_execution_id = Uuid::new_v4().to_string();
        let message = FlowStartMessage {
            flow_definition_id: target.target_flow_definition_id.clone(),
            flow_version: target.target_flow_version,
            initial_context_data: input,
            flow_execution_id: Some(flow_execution_id.clone()),
            trigger_source: target.trigger_source.clone(),
            parent_execution_id: sub_flow.then(|| state.flow_execution_id.clone()),
        };

        self.flow_starts
            .enqueue(message)
            .await
            .map_err(|e| match e {
                CoreError::ConfigurationError(_) | CoreError::ValidationError(_) => StepError::from(e),
                other => StepError::transient(format!("Failed to enqueue flow start: {}", other)),
            })?;

        info!(
            flow_execution_id = %state.flow_execution_id,
            step_id = %step.step_instance_id,
            started = %flow_execution_id,
            target_flow = %target.target_flow_definition_id,
            sub_flow,
            "Flow start enqueued"
        );
        self.complete_step(flow, step, state, json!({ "flowExecutionId": flow_execution_id }))
            .await
    }

    async fn poll(
        &self,
        flow: &FlowDefinition,
        step: &StepInstance,
        mut state: ExecutionState,
        polling: &PollingConfig,
    ) -> Result<StepResult, StepError> {
        let input = self.resolve_input(flow, step, &state).await?;
        let output = self.dispatcher.dispatch(step, input, &state).await?;

        let complete = match &polling.completion_condition {
            None => true,
            Some(condition) => {
                let mut scope = state.scope();
                if let Value::Object(entries) = &mut scope {
                    entries.insert("pollResult".to_string(), output.clone());
                }
                self.evaluator.evaluate(condition, &scope).await?
            }
        };

        let counter = poll_counter(&step.step_instance_id);
        if complete {
            state.reset_attempts(&counter);
            return self.complete_step(flow, step, state, output).await;
        }

        let attempts = state.increment_attempts(&counter);
        if attempts >= polling.max_attempts {
            return Err(StepError::Unclassified {
                name: "PollingTimeoutError".to_string(),
                message: format!(
                    "step {} did not complete within {} polling attempts",
                    step.step_instance_id, polling.max_attempts
                ),
            });
        }

        debug!(
            flow_execution_id = %state.flow_execution_id,
            step_id = %step.step_instance_id,
            attempts,
            max_attempts = polling.max_attempts,
            "Poll not complete"
        );
        Ok(StepResult::new(
            state,
            NextAction::Poll {
                polling_config: polling.clone(),
            },
        ))
    }

    /// Fold a step's output into the context and plan the next step
    async fn complete_step(
        &self,
        flow: &FlowDefinition,
        step: &StepInstance,
        mut state: ExecutionState,
        output: Value,
    ) -> Result<StepResult, StepError> {
        self.mapper
            .apply_output(&mut state, &step.output_mappings, &output)
            .await?;
        state.reset_attempts(&step.step_instance_id);
        state.error_info = None;

        let next = self.transitions.next_step(step, &state.scope()).await?;
        let action = TransitionResolver::action_for(flow, next.as_deref())?;

        match next {
            Some(next) => {
                debug!(
                    flow_execution_id = %state.flow_execution_id,
                    step_id = %step.step_instance_id,
                    next = %next,
                    "Step completed"
                );
                state.current_step_instance_id = Some(next);
            }
            None => {
                info!(flow_execution_id = %state.flow_execution_id, step_id = %step.step_instance_id, "Execution completed");
                state.status = ExecutionStatus::Completed;
                state.current_step_instance_id = None;
            }
        }
        Ok(StepResult::new(state, action))
    }

    /// Turn a step outcome into the invocation result; failures start from
    /// the state as it was before the step ran.
    fn settle(
        &self,
        flow: &FlowDefinition,
        step: &StepInstance,
        mut state: ExecutionState,
        outcome: Result<StepResult, StepError>,
    ) -> Result<StepResult, RetryableFailure> {
        let error = match outcome {
            Ok(result) => return Ok(result),
            Err(error) => error,
        };
        let info = error.to_error_info();

        if error.is_retryable() {
            let attempts = state.increment_attempts(&step.step_instance_id);
            if attempts <= self.config.max_retry_attempts {
                warn!(
                    flow_execution_id = %state.flow_execution_id,
                    step_id = %step.step_instance_id,
                    attempts,
                    max_attempts = self.config.max_retry_attempts,
                    error = %error,
                    "Step failed, retry requested"
                );
                return Err(RetryableFailure { state, error: info });
            }
            error!(
                flow_execution_id = %state.flow_execution_id,
                step_id = %step.step_instance_id,
                attempts,
                "Retry budget exhausted"
            );
        }

        Ok(fail_step(Some(flow), state, &step.step_instance_id, info))
    }

    fn wrong_step_kind(
        &self,
        flow: &FlowDefinition,
        step: &StepInstance,
        state: ExecutionState,
        expected: &str,
    ) -> StepResult {
        let info = StepError::permanent(format!(
            "step {} is {}, expected {}",
            step.step_instance_id,
            step.kind.type_name(),
            expected
        ))
        .to_error_info();
        fail_step(Some(flow), state, &step.step_instance_id, info)
    }
}

fn poll_counter(step_instance_id: &str) -> String {
    format!("{}:poll", step_instance_id)
}

fn fail_step(
    flow: Option<&FlowDefinition>,
    mut state: ExecutionState,
    step_instance_id: &str,
    info: ErrorInfo,
) -> StepResult {
    state.reset_attempts(&poll_counter(step_instance_id));
    handle_terminal_failure(flow, state, Some(step_instance_id), info)
}
