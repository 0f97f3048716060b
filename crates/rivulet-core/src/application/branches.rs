//! Fan-out and fan-in for parallel fork steps
//!
//! The interpreter never runs branches itself. It builds one payload per
//! qualifying branch for the orchestrator and later merges the results the
//! orchestrator hands back.

use super::data_mapper::DataMapper;
use super::handler::HandlerRegistry;
use crate::domain::branch::{BranchPayload, BranchResult};
use crate::domain::execution_state::ExecutionState;
use crate::domain::flow_definition::{AggregationConfig, AggregationStrategy, ForkConfig, StepInstance};
use crate::domain::repository::HandlerRequest;
use crate::expression::ConditionEvaluator;
use crate::{CoreError, StepError};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Builds branch payloads and aggregates branch results
#[derive(Clone)]
pub struct BranchOrchestrator {
    mapper: DataMapper,
    evaluator: ConditionEvaluator,
    registry: Arc<HandlerRegistry>,
}

impl BranchOrchestrator {
    /// Create an orchestrator
    pub fn new(mapper: DataMapper, evaluator: ConditionEvaluator, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            mapper,
            evaluator,
            registry,
        }
    }

    /// Build the payloads of every branch whose condition holds, in branch order
    pub async fn fan_out(
        &self,
        fork: &ForkConfig,
        state: &ExecutionState,
    ) -> Result<Vec<BranchPayload>, CoreError> {
        let scope = state.scope();
        let mut payloads = Vec::with_capacity(fork.parallel_branches.len());

        for (index, branch) in fork.parallel_branches.iter().enumerate() {
            if let Some(condition) = &branch.condition {
                if !self.evaluator.evaluate(condition, &scope).await? {
                    debug!(branch_id = %branch.branch_id, "Branch condition is false, skipping");
                    continue;
                }
            }

            let input_data = self
                .mapper
                .resolve_mappings(&branch.input_mappings, &branch.literals, &scope)
                .await?;
            payloads.push(BranchPayload {
                branch_id: branch.branch_id.clone(),
                branch_index: index,
                branch_execution_id: BranchPayload::branch_execution_id(
                    &state.flow_execution_id,
                    &branch.branch_id,
                ),
                target: branch.target.clone(),
                input_data,
            });
        }

        info!(
            flow_execution_id = %state.flow_execution_id,
            branches = payloads.len(),
            skipped = fork.parallel_branches.len() - payloads.len(),
            "Fanning out parallel branches"
        );
        Ok(payloads)
    }

    /// Merge branch results into the fork step's output
    pub async fn aggregate(
        &self,
        config: &AggregationConfig,
        mut results: Vec<BranchResult>,
        step: &StepInstance,
        state: &ExecutionState,
    ) -> Result<Value, StepError> {
        results.sort_by_key(|r| r.branch_index);
        check_failure_policy(config, &results)?;

        match config.strategy {
            AggregationStrategy::CollectArray => Ok(Value::Array(
                results
                    .into_iter()
                    .filter(|r| r.succeeded)
                    .map(|r| r.output.unwrap_or(Value::Null))
                    .collect(),
            )),
            AggregationStrategy::CollectDataPath => {
                let path = config.data_path.as_deref().ok_or_else(|| {
                    StepError::permanent("COLLECT_DATA_PATH aggregation requires dataPath")
                })?;
                let mut collected = Vec::new();
                for result in results.into_iter().filter(|r| r.succeeded) {
                    let output = result.output.unwrap_or(Value::Null);
                    let projected = self
                        .mapper
                        .renderer()
                        .resolver()
                        .resolve(path, &output, true)
                        .await?;
                    collected.push(projected.into_value_or_null());
                }
                Ok(Value::Array(collected))
            }
            AggregationStrategy::CustomModule => {
                let module = config.module_identifier.as_deref().ok_or_else(|| {
                    StepError::permanent("CUSTOM_MODULE aggregation requires moduleIdentifier")
                })?;
                let handler = self.registry.get(module).ok_or_else(|| {
                    StepError::permanent(format!("No aggregation module registered: {}", module))
                })?;

                let mut input = Map::new();
                input.insert("branchResults".to_string(), serde_json::to_value(&results).map_err(CoreError::from)?);
                input.insert("aggregationConfig".to_string(), serde_json::to_value(config).map_err(CoreError::from)?);
                let request = HandlerRequest {
                    step_definition: step.clone(),
                    step_input: input,
                    execution_state: state.clone(),
                };
                handler.execute(&request).await
            }
        }
    }
}

/// Decide whether the failed branches fail the step.
///
/// A tolerance percentage, when set, decides alone:
/// `failed * 100 / total <= tolerance`. Otherwise `failOnBranchError`
/// decides.
fn check_failure_policy(config: &AggregationConfig, results: &[BranchResult]) -> Result<(), StepError> {
    let failed: Vec<&str> = results
        .iter()
        .filter(|r| !r.succeeded)
        .map(|r| r.branch_id.as_str())
        .collect();
    if failed.is_empty() {
        return Ok(());
    }

    let total = results.len();
    let tolerated = match config.tolerated_failure_percentage {
        Some(tolerance) => (failed.len() as f64 / total as f64) * 100.0 <= tolerance,
        None => !config.fail_on_branch_error,
    };

    if tolerated {
        warn!(failed = failed.len(), total, "Tolerating failed branches");
        return Ok(());
    }

    Err(StepError::Unclassified {
        name: "BranchFailureError".to_string(),
        message: format!(
            "{} of {} branches failed: {}",
            failed.len(),
            total,
            failed.join(", ")
        ),
    })
}

#[cfg(all(test, feature = "testing"))]
mod tests {
    use super::*;
    use crate::application::handler::StepHandler;
    use crate::config::InterpreterConfig;
    use crate::domain::flow_definition::{BranchTarget, FlowId};
    use crate::domain::repository::memory::MemoryObjectStore;
    use crate::expression::{TemplateRenderer, ValueResolver};
    use crate::ErrorInfo;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct CountSucceeded;

    #[async_trait]
    impl StepHandler for CountSucceeded {
        fn module_identifier(&self) -> &str {
            "agg.count"
        }

        async fn execute(&self, request: &HandlerRequest) -> Result<Value, StepError> {
            let results = request.step_input["branchResults"].as_array().cloned().unwrap_or_default();
            let ok = results.iter().filter(|r| r["succeeded"] == json!(true)).count();
            Ok(json!({ "succeeded": ok }))
        }
    }

    fn orchestrator() -> BranchOrchestrator {
        let store = Arc::new(MemoryObjectStore::new());
        let resolver = ValueResolver::new(store.clone());
        let mapper = DataMapper::new(
            TemplateRenderer::new(resolver.clone(), 10),
            store,
            &InterpreterConfig::default(),
        );
        BranchOrchestrator::new(
            mapper,
            ConditionEvaluator::new(resolver),
            Arc::new(HandlerRegistry::new().with(Arc::new(CountSucceeded))),
        )
    }

    fn fork_step() -> StepInstance {
        serde_json::from_value(json!({
            "stepInstanceId": "fan",
            "stepType": "PARALLEL_FORK_MANAGER",
            "parallelBranches": [
                {"branchId": "eu", "target": {"type": "STEP_REF", "stepInstanceId": "ship"},
                 "inputMappings": {"region": "$.regions[0]"}, "literals": {"priority": 1}},
                {"branchId": "us", "target": {"type": "STEP_REF", "stepInstanceId": "ship"},
                 "condition": "$.includeUs == true"},
                {"branchId": "audit", "target": {"type": "SUB_FLOW", "flowDefinitionId": "audit", "version": 1},
                 "inputMappings": {"order": "{{orderId}}"}}
            ]
        }))
        .unwrap()
    }

    fn state(include_us: bool) -> ExecutionState {
        let mut context = Map::new();
        context.insert("regions".to_string(), json!(["eu-west", "us-east"]));
        context.insert("includeUs".to_string(), json!(include_us));
        context.insert("orderId".to_string(), json!("o-9"));
        ExecutionState::new("exec-7", FlowId("orders".to_string()), 1).with_context(context)
    }

    fn fork_config(step: &StepInstance) -> ForkConfig {
        match &step.kind {
            crate::domain::flow_definition::StepKind::ParallelForkManager(fork) => fork.clone(),
            _ => unreachable!(),
        }
    }

    fn results(outcomes: &[bool]) -> Vec<BranchResult> {
        outcomes
            .iter()
            .enumerate()
            .map(|(i, ok)| {
                if *ok {
                    BranchResult::success(format!("b{}", i), i, json!({"n": i}))
                } else {
                    BranchResult::failure(format!("b{}", i), i, ErrorInfo::terminal("Boom", "failed"))
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_fan_out_payloads() {
        let step = fork_step();
        let payloads = orchestrator().fan_out(&fork_config(&step), &state(false)).await.unwrap();

        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0].branch_id, "eu");
        assert_eq!(payloads[0].branch_execution_id, "exec-7:eu");
        assert_eq!(Value::Object(payloads[0].input_data.clone()), json!({"region": "eu-west", "priority": 1}));
        assert_eq!(payloads[1].branch_id, "audit");
        assert_eq!(payloads[1].branch_index, 2);
        assert_eq!(
            payloads[1].target,
            BranchTarget::SubFlow { flow_definition_id: FlowId("audit".to_string()), version: 1 }
        );
        assert_eq!(payloads[1].input_data["order"], json!("o-9"));

        let all = orchestrator().fan_out(&fork_config(&step), &state(true)).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_collect_array_preserves_input_order() {
        let mut shuffled = results(&[true, true, true]);
        shuffled.reverse();
        let output = orchestrator()
            .aggregate(&AggregationConfig::default(), shuffled, &fork_step(), &state(false))
            .await
            .unwrap();
        assert_eq!(output, json!([{"n": 0}, {"n": 1}, {"n": 2}]));
    }

    #[tokio::test]
    async fn test_tolerance_boundary() {
        let config = AggregationConfig {
            tolerated_failure_percentage: Some(50.0),
            ..AggregationConfig::default()
        };

        let two_failed = orchestrator()
            .aggregate(&config, results(&[true, false, true, false, true]), &fork_step(), &state(false))
            .await
            .unwrap();
        assert_eq!(two_failed.as_array().unwrap().len(), 3);

        let three_failed = orchestrator()
            .aggregate(&config, results(&[false, false, true, false, true]), &fork_step(), &state(false))
            .await
            .unwrap_err();
        assert_eq!(three_failed.error_name(), "BranchFailureError");
        assert!(!three_failed.is_retryable());
        assert!(three_failed.to_string().contains("b0, b1, b3"));
    }

    #[tokio::test]
    async fn test_fail_on_branch_error_flag() {
        let strict = orchestrator()
            .aggregate(&AggregationConfig::default(), results(&[true, false]), &fork_step(), &state(false))
            .await;
        assert!(strict.is_err());

        let lenient = AggregationConfig {
            fail_on_branch_error: false,
            ..AggregationConfig::default()
        };
        let output = orchestrator()
            .aggregate(&lenient, results(&[true, false]), &fork_step(), &state(false))
            .await
            .unwrap();
        assert_eq!(output, json!([{"n": 0}]));
    }

    #[tokio::test]
    async fn test_data_path_and_custom_strategies() {
        let projected = AggregationConfig {
            strategy: AggregationStrategy::CollectDataPath,
            data_path: Some("$.n".to_string()),
            ..AggregationConfig::default()
        };
        let output = orchestrator()
            .aggregate(&projected, results(&[true, true]), &fork_step(), &state(false))
            .await
            .unwrap();
        assert_eq!(output, json!([0, 1]));

        let custom = AggregationConfig {
            strategy: AggregationStrategy::CustomModule,
            module_identifier: Some("agg.count".to_string()),
            fail_on_branch_error: false,
            ..AggregationConfig::default()
        };
        let output = orchestrator()
            .aggregate(&custom, results(&[true, false, true]), &fork_step(), &state(false))
            .await
            .unwrap();
        assert_eq!(output, json!({"succeeded": 2}));
    }

    #[tokio::test]
    async fn test_empty_results_aggregate_to_empty_array() {
        let output = orchestrator()
            .aggregate(&AggregationConfig::default(), Vec::new(), &fork_step(), &state(false))
            .await
            .unwrap();
        assert_eq!(output, json!([]));
    }
}
