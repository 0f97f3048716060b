use async_trait::async_trait;
use pretty_assertions::assert_eq;
use rivulet_core::domain::repository::memory::{
    MemoryContinuationStore, MemoryFlowStartQueue, MemoryMetadataStore, MemoryObjectStore,
    RecordingResumeSignal,
};
use rivulet_core::{
    BranchResult, ExecutionState, ExecutionStatus, FlowDefinition, FlowId, FlowStartMessage,
    HandlerRegistry, HandlerRequest, InterpreterConfig, InterpreterPorts, LargeValuePointer,
    NextAction, StepError, StepHandler, StepInterpreter, StepResult,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;

struct Echo;

#[async_trait]
impl StepHandler for Echo {
    fn module_identifier(&self) -> &str {
        "test.echo"
    }

    async fn execute(&self, request: &HandlerRequest) -> Result<Value, StepError> {
        Ok(Value::Object(request.step_input.clone()))
    }
}

struct Report;

#[async_trait]
impl StepHandler for Report {
    fn module_identifier(&self) -> &str {
        "test.report"
    }

    async fn execute(&self, _request: &HandlerRequest) -> Result<Value, StepError> {
        Ok(json!({ "body": "x".repeat(5000) }))
    }
}

struct Measure;

#[async_trait]
impl StepHandler for Measure {
    fn module_identifier(&self) -> &str {
        "test.measure"
    }

    async fn execute(&self, request: &HandlerRequest) -> Result<Value, StepError> {
        let length = request
            .step_input
            .get("report")
            .and_then(Value::as_str)
            .map(str::len)
            .ok_or_else(|| StepError::permanent("report is not a string"))?;
        Ok(json!({ "length": length }))
    }
}

struct Reject;

#[async_trait]
impl StepHandler for Reject {
    fn module_identifier(&self) -> &str {
        "test.reject"
    }

    async fn execute(&self, _request: &HandlerRequest) -> Result<Value, StepError> {
        Err(StepError::permanent("payment declined"))
    }
}

fn order_flow() -> FlowDefinition {
    serde_json::from_value(json!({
        "id": "order-processing",
        "version": 1,
        "isPublished": true,
        "startStepInstanceId": "validate",
        "steps": {
            "validate": {
                "stepInstanceId": "validate",
                "stepType": "CUSTOM_LOGIC",
                "moduleIdentifier": "test.echo",
                "inputMappings": {"amount": "{{order.amount}}", "customer": "{{order.customer}}"},
                "outputMappings": {"validated": "$"},
                "transitions": [
                    {"condition": "$.order.amount > 100", "nextStepInstanceId": "approval"}
                ],
                "defaultNextStepInstanceId": "fanout"
            },
            "approval": {
                "stepInstanceId": "approval",
                "stepType": "WAIT_FOR_EXTERNAL_EVENT",
                "correlationKeyTemplate": "approval-{{order.id}}",
                "maxWaitTimeSeconds": 600,
                "outputMappings": {"approvedBy": "$.approver"},
                "defaultNextStepInstanceId": "fanout"
            },
            "fanout": {
                "stepInstanceId": "fanout",
                "stepType": "PARALLEL_FORK_MANAGER",
                "parallelBranches": [
                    {
                        "branchId": "invoice",
                        "target": {"type": "STEP_REF", "stepInstanceId": "invoice"},
                        "inputMappings": {"amount": "{{order.amount}}"}
                    },
                    {
                        "branchId": "notify",
                        "target": {"type": "STEP_REF", "stepInstanceId": "notify"},
                        "condition": "$.order.notify == true"
                    }
                ],
                "aggregationConfig": {"strategy": "COLLECT_DATA_PATH", "dataPath": "$.branchTag"},
                "outputMappings": {"branchTags": "$"},
                "defaultNextStepInstanceId": "report"
            },
            "invoice": {
                "stepInstanceId": "invoice",
                "stepType": "CUSTOM_LOGIC",
                "moduleIdentifier": "test.echo",
                "literals": {"tag": "invoice"},
                "outputMappings": {"branchTag": "$.tag"}
            },
            "notify": {
                "stepInstanceId": "notify",
                "stepType": "NO_OP",
                "literals": {"tag": "notify"},
                "outputMappings": {"branchTag": "$.tag"}
            },
            "report": {
                "stepInstanceId": "report",
                "stepType": "DATA_LOAD",
                "moduleIdentifier": "test.report",
                "outputMappings": {"report": "$.body"},
                "defaultNextStepInstanceId": "measure"
            },
            "measure": {
                "stepInstanceId": "measure",
                "stepType": "CUSTOM_LOGIC",
                "moduleIdentifier": "test.measure",
                "inputMappings": {"report": "$.report"},
                "outputMappings": {"reportLength": "$.length"},
                "defaultNextStepInstanceId": "end"
            },
            "end": {"stepInstanceId": "end", "stepType": "END_FLOW"}
        }
    }))
    .unwrap()
}

fn refund_flow() -> FlowDefinition {
    serde_json::from_value(json!({
        "id": "payments",
        "version": 2,
        "startStepInstanceId": "charge",
        "steps": {
            "charge": {
                "stepInstanceId": "charge",
                "stepType": "CUSTOM_LOGIC",
                "moduleIdentifier": "test.reject",
                "onError": {"fallbackStepInstanceId": "refund"},
                "defaultNextStepInstanceId": "end"
            },
            "refund": {
                "stepInstanceId": "refund",
                "stepType": "START_SUB_FLOW",
                "targetFlowDefinitionId": "refunds",
                "targetFlowVersion": 1,
                "inputMappings": {"reason": "$.errorInfo.errorMessage"},
                "outputMappings": {"refundExecutionId": "$.flowExecutionId"},
                "defaultNextStepInstanceId": "end"
            },
            "end": {"stepInstanceId": "end", "stepType": "END_FLOW"}
        }
    }))
    .unwrap()
}

struct Harness {
    interpreter: StepInterpreter,
    object_store: Arc<MemoryObjectStore>,
    continuations: Arc<MemoryContinuationStore>,
    queue: Arc<MemoryFlowStartQueue>,
}

fn harness() -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("rivulet_core=debug")
        .with_test_writer()
        .try_init();

    let metadata = Arc::new(MemoryMetadataStore::new());
    metadata.insert_flow(order_flow());
    metadata.insert_flow(refund_flow());

    let object_store = Arc::new(MemoryObjectStore::new());
    let continuations = Arc::new(MemoryContinuationStore::new());
    let queue = Arc::new(MemoryFlowStartQueue::new());
    let registry = HandlerRegistry::new()
        .with(Arc::new(Echo))
        .with(Arc::new(Report))
        .with(Arc::new(Measure))
        .with(Arc::new(Reject));

    let config = InterpreterConfig {
        offload_threshold_bytes: 1024,
        ..InterpreterConfig::default()
    };
    let interpreter = StepInterpreter::new(
        config,
        Arc::new(registry),
        InterpreterPorts {
            object_store: object_store.clone(),
            metadata,
            continuations: continuations.clone(),
            flow_starts: queue.clone(),
            invoker: None,
        },
    );

    Harness {
        interpreter,
        object_store,
        continuations,
        queue,
    }
}

async fn start(interpreter: &StepInterpreter, flow: &str, version: u32, context: Value) -> ExecutionState {
    let Value::Object(initial_context_data) = context else {
        panic!("context must be an object");
    };
    interpreter
        .start(FlowStartMessage {
            flow_definition_id: FlowId(flow.to_string()),
            flow_version: version,
            initial_context_data,
            flow_execution_id: Some("exec-1".to_string()),
            trigger_source: Some("test".to_string()),
            parent_execution_id: None,
        })
        .await
        .unwrap()
        .state
}

/// Invoke `execute` while the action is CONTINUE
async fn run(interpreter: &StepInterpreter, mut state: ExecutionState) -> StepResult {
    loop {
        let result = interpreter.execute(state).await.unwrap();
        if result.action != NextAction::Continue {
            return result;
        }
        state = result.state;
    }
}

/// Play the orchestrator's part for a fork: run every branch to its end
async fn run_branches(interpreter: &StepInterpreter, parent: &StepResult) -> Vec<BranchResult> {
    let NextAction::Fork { branches, .. } = &parent.action else {
        panic!("expected a fork, got {:?}", parent.action);
    };
    let mut results = Vec::new();
    for payload in branches.iter().rev() {
        let branch_state = payload.to_execution_state(&parent.state);
        let finished = run(interpreter, branch_state).await;
        assert_eq!(finished.action, NextAction::Finalize);
        results.push(BranchResult::from_final_state(payload, &finished.state));
    }
    results
}

#[tokio::test]
async fn test_small_order_runs_to_completion() {
    let h = harness();
    let state = start(
        &h.interpreter,
        "order-processing",
        1,
        json!({"order": {"id": "o-7", "amount": 40, "customer": "ada", "notify": false}}),
    )
    .await;

    let forked = run(&h.interpreter, state).await;
    assert_eq!(forked.state.current_step_instance_id.as_deref(), Some("fanout"));
    assert_eq!(
        forked.state.current_context_data["validated"],
        json!({"amount": 40, "customer": "ada"})
    );

    let results = run_branches(&h.interpreter, &forked).await;
    assert_eq!(results.len(), 1);

    let aggregated = h.interpreter.aggregate(forked.state, results).await.unwrap();
    assert_eq!(aggregated.action, NextAction::Continue);
    assert_eq!(aggregated.state.current_context_data["branchTags"], json!(["invoice"]));

    let finished = run(&h.interpreter, aggregated.state).await;
    assert_eq!(finished.action, NextAction::Finalize);
    assert_eq!(finished.state.status, ExecutionStatus::Completed);
    assert!(finished.state.current_step_instance_id.is_none());
    assert_eq!(finished.state.current_context_data["reportLength"], json!(5000));

    // The report was offloaded and read back through its pointer
    let pointer = LargeValuePointer::detect(&finished.state.current_context_data["report"]).unwrap();
    assert!(pointer.object_store_ref.key.starts_with("exec-1/report/"));
    assert_eq!(h.object_store.len(), 1);
    assert!(h.queue.messages().is_empty());
}

#[tokio::test]
async fn test_large_order_waits_for_approval() {
    let h = harness();
    let state = start(
        &h.interpreter,
        "order-processing",
        1,
        json!({"order": {"id": "o-8", "amount": 250, "customer": "grace", "notify": true}}),
    )
    .await;

    let waiting = run(&h.interpreter, state).await;
    assert_eq!(waiting.action, NextAction::Suspend);
    assert_eq!(waiting.state.current_step_instance_id.as_deref(), Some("approval"));

    // The wait step itself does not change anything when executed
    let again = h.interpreter.execute(waiting.state.clone()).await.unwrap();
    assert_eq!(again.state, waiting.state);
    assert_eq!(again.action, NextAction::Suspend);

    let suspended = h
        .interpreter
        .suspend(waiting.state.clone(), "token-123")
        .await
        .unwrap();
    assert_eq!(suspended.action, NextAction::Suspend);
    assert_eq!(h.continuations.len(), 1);

    let signal = RecordingResumeSignal::new();
    let record = h
        .interpreter
        .suspension()
        .resume(&signal, "approval-o-8", &json!({"approver": "lin"}))
        .await
        .unwrap();
    assert_eq!(record.flow_execution_id, "exec-1");
    assert_eq!(record.step_instance_id, "approval");
    assert!(h.continuations.is_empty());
    assert_eq!(signal.delivered()[0].0, "token-123");

    let resumed = h
        .interpreter
        .resume_with_event(suspended.state, json!({"approver": "lin"}))
        .await
        .unwrap();
    assert_eq!(resumed.state.current_context_data["approvedBy"], "lin");
    assert_eq!(resumed.action, NextAction::Continue);
    assert_eq!(resumed.state.current_step_instance_id.as_deref(), Some("fanout"));

    let forked = h.interpreter.execute(resumed.state).await.unwrap();
    assert!(matches!(forked.action, NextAction::Fork { .. }));
    let results = run_branches(&h.interpreter, &forked).await;
    assert_eq!(results.len(), 2);

    let aggregated = h.interpreter.aggregate(forked.state, results).await.unwrap();
    assert_eq!(
        aggregated.state.current_context_data["branchTags"],
        json!(["invoice", "notify"])
    );
}

#[tokio::test]
async fn test_fork_payloads() {
    let h = harness();
    let mut state = start(
        &h.interpreter,
        "order-processing",
        1,
        json!({"order": {"id": "o-9", "amount": 40, "notify": true}}),
    )
    .await;
    state.status = ExecutionStatus::Running;
    state.current_step_instance_id = Some("fanout".to_string());

    let result = h.interpreter.execute(state).await.unwrap();
    let NextAction::Fork {
        branches,
        aggregation_config,
        max_concurrency,
    } = result.action
    else {
        panic!("expected a fork");
    };

    assert_eq!(branches.len(), 2);
    assert_eq!(branches[0].branch_execution_id, "exec-1:invoice");
    assert_eq!(branches[0].input_data, {
        let mut input = Map::new();
        input.insert("amount".to_string(), json!(40));
        input
    });
    assert_eq!(branches[1].branch_index, 1);
    assert_eq!(aggregation_config.data_path.as_deref(), Some("$.branchTag"));
    assert_eq!(max_concurrency, None);
}

#[tokio::test]
async fn test_failed_branch_fails_fork() {
    let h = harness();
    let mut state = start(
        &h.interpreter,
        "order-processing",
        1,
        json!({"order": {"id": "o-10", "amount": 40, "notify": true}}),
    )
    .await;
    state.status = ExecutionStatus::Running;
    state.current_step_instance_id = Some("fanout".to_string());

    let results = vec![
        BranchResult::success("invoice", 0, json!({"branchTag": "invoice"})),
        BranchResult::failure("notify", 1, StepError::transient("smtp down").to_error_info()),
    ];
    let result = h.interpreter.aggregate(state, results).await.unwrap();

    assert_eq!(result.state.status, ExecutionStatus::Failed);
    let error = result.state.error_info.unwrap();
    assert_eq!(error.error_name, "BranchFailureError");
    assert!(error.error_message.contains("notify"));
}

#[tokio::test]
async fn test_permanent_failure_routes_to_fallback() {
    let h = harness();
    let state = start(&h.interpreter, "payments", 2, json!({"paymentId": "p-1"})).await;

    let at_fallback = h.interpreter.execute(state).await.unwrap();
    assert_eq!(at_fallback.state.status, ExecutionStatus::Running);
    assert_eq!(at_fallback.state.current_step_instance_id.as_deref(), Some("refund"));
    assert_eq!(at_fallback.action, NextAction::Continue);
    assert_eq!(
        at_fallback.state.error_info.as_ref().unwrap().error_message,
        "payment declined"
    );

    let refunded = h.interpreter.execute(at_fallback.state).await.unwrap();
    assert!(refunded.state.error_info.is_none());

    let messages = h.queue.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].flow_definition_id, FlowId("refunds".to_string()));
    assert_eq!(messages[0].parent_execution_id.as_deref(), Some("exec-1"));
    assert_eq!(messages[0].initial_context_data["reason"], "payment declined");
    assert_eq!(
        refunded.state.current_context_data["refundExecutionId"],
        json!(messages[0].flow_execution_id.clone().unwrap())
    );

    let finished = h.interpreter.execute(refunded.state).await.unwrap();
    assert_eq!(finished.state.status, ExecutionStatus::Completed);
    assert_eq!(finished.action, NextAction::Finalize);
}

#[tokio::test]
async fn test_missing_flow_fails_execution() {
    let h = harness();
    let state = ExecutionState::new("exec-2", FlowId("ghost".to_string()), 1);

    let result = h.interpreter.execute(state).await.unwrap();
    assert_eq!(result.state.status, ExecutionStatus::Failed);
    assert_eq!(result.state.error_info.unwrap().error_name, "FlowDefinitionNotFound");
    assert_eq!(result.action, NextAction::Finalize);
}

#[tokio::test]
async fn test_missing_step_fails_execution() {
    let h = harness();
    let mut state = ExecutionState::new("exec-3", FlowId("order-processing".to_string()), 1);
    state.status = ExecutionStatus::Running;
    state.current_step_instance_id = Some("vanished".to_string());

    let result = h.interpreter.execute(state).await.unwrap();
    assert_eq!(result.state.status, ExecutionStatus::Failed);
    assert_eq!(result.state.error_info.unwrap().error_name, "StepNotFound");
}

#[test]
fn test_flow_validation_reports_all_problems() {
    assert!(order_flow().validate().is_ok());

    let broken: FlowDefinition = serde_json::from_value(json!({
        "id": "broken",
        "version": 0,
        "startStepInstanceId": "nowhere",
        "steps": {
            "a": {"stepInstanceId": "b", "stepType": "NO_OP", "defaultNextStepInstanceId": "c"}
        }
    }))
    .unwrap();

    let message = broken.validate().unwrap_err().to_string();
    assert!(message.contains("version must be positive"));
    assert!(message.contains("does not match stepInstanceId"));
    assert!(message.contains("unknown step: nowhere"));
    assert!(message.contains("unknown step: c"));
}
