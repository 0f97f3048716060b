use super::handler::HandlerRegistry;
use crate::domain::execution_state::ExecutionState;
use crate::domain::flow_definition::StepInstance;
use crate::domain::repository::{HandlerInvoker, HandlerRequest, MetadataStore};
use crate::StepError;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Resolves a step's handler and invokes it.
///
/// Built-in handlers come from the registry. Anything else is looked up in
/// the metadata store and invoked over RPC. Every failure leaving this type
/// is a classified [`StepError`].
#[derive(Clone)]
pub struct StepDispatcher {
    registry: Arc<HandlerRegistry>,
    metadata: Arc<dyn MetadataStore>,
    invoker: Option<Arc<dyn HandlerInvoker>>,
}

impl StepDispatcher {
    /// Create a dispatcher
    pub fn new(
        registry: Arc<HandlerRegistry>,
        metadata: Arc<dyn MetadataStore>,
        invoker: Option<Arc<dyn HandlerInvoker>>,
    ) -> Self {
        Self {
            registry,
            metadata,
            invoker,
        }
    }

    /// Registry of built-in handlers
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Invoke the handler of `step` with `input`
    pub async fn dispatch(
        &self,
        step: &StepInstance,
        input: Map<String, Value>,
        state: &ExecutionState,
    ) -> Result<Value, StepError> {
        let module = step.module_identifier.as_deref().ok_or_else(|| {
            StepError::permanent(format!(
                "step {} of type {} has no moduleIdentifier",
                step.step_instance_id,
                step.kind.type_name()
            ))
        })?;

        let request = HandlerRequest {
            step_definition: step.clone(),
            step_input: input,
            execution_state: state.clone(),
        };

        if let Some(handler) = self.registry.get(module) {
            debug!(
                flow_execution_id = %state.flow_execution_id,
                step_id = %step.step_instance_id,
                module = %module,
                "Invoking built-in handler"
            );
            return handler.execute(&request).await.map_err(|e| {
                error!(
                    flow_execution_id = %state.flow_execution_id,
                    step_id = %step.step_instance_id,
                    module = %module,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Built-in handler failed"
                );
                e
            });
        }

        let registration = self
            .metadata
            .get_handler_registration(module)
            .await?
            .ok_or_else(|| StepError::permanent(format!("No handler registered for module: {}", module)))?;

        let invoker = self.invoker.as_ref().ok_or_else(|| {
            StepError::permanent(format!(
                "module {} is external but no handler invoker is configured",
                module
            ))
        })?;

        info!(
            flow_execution_id = %state.flow_execution_id,
            step_id = %step.step_instance_id,
            module = %module,
            endpoint = %registration.endpoint,
            "Invoking external handler"
        );

        let response = invoker
            .invoke(&registration, &request)
            .await
            .map_err(|e| {
                error!(module = %module, error = %e, "External handler invocation failed");
                StepError::Transient {
                    message: e.to_string(),
                    details: Some(json!({ "module": module })),
                }
            })?;

        interpret_response(module, response)
    }
}

/// Read an external handler response.
///
/// `{outputData}` is success. A reported application error is permanent and
/// keeps the handler's own error name in the details. Anything else is a
/// malformed response and therefore transient.
pub fn interpret_response(module: &str, response: Value) -> Result<Value, StepError> {
    let Value::Object(mut body) = response else {
        return Err(StepError::transient(format!(
            "Malformed response from handler {}: not an object",
            module
        )));
    };

    if let Some(output) = body.remove("outputData") {
        return Ok(output);
    }

    let reported_name = body
        .get("errorName")
        .or_else(|| body.get("errorType"))
        .and_then(Value::as_str)
        .map(str::to_string);

    if let Some(name) = reported_name {
        let message = body
            .get("errorMessage")
            .and_then(Value::as_str)
            .unwrap_or("handler reported an error")
            .to_string();
        return Err(StepError::permanent_with(
            message,
            json!({
                "module": module,
                "handlerErrorName": name,
                "handlerErrorDetails": body.remove("errorDetails").unwrap_or(Value::Null),
            }),
        ));
    }

    Err(StepError::transient(format!(
        "Malformed response from handler {}: missing outputData",
        module
    )))
}

#[cfg(all(test, feature = "testing"))]
mod tests {
    use super::*;
    use crate::application::handler::StepHandler;
    use crate::domain::flow_definition::FlowId;
    use crate::domain::repository::memory::MemoryMetadataStore;
    use crate::domain::repository::{HandlerRegistration, InvocationError, MockHandlerInvoker};
    use async_trait::async_trait;

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

    fn step(module: Option<&str>) -> StepInstance {
        let mut step: StepInstance = serde_json::from_value(json!({
            "stepInstanceId": "s1",
            "stepType": "CUSTOM_LOGIC"
        }))
        .unwrap();
        step.module_identifier = module.map(str::to_string);
        step
    }

    fn state() -> ExecutionState {
        ExecutionState::new("exec-1", FlowId("f".to_string()), 1)
    }

    fn input() -> Map<String, Value> {
        let mut input = Map::new();
        input.insert("x".to_string(), json!(1));
        input
    }

    fn metadata_with_remote() -> Arc<MemoryMetadataStore> {
        let metadata = Arc::new(MemoryMetadataStore::new());
        metadata.insert_handler(HandlerRegistration {
            module_identifier: "remote.score".to_string(),
            endpoint: "http://handlers/score".to_string(),
            timeout_seconds: None,
        });
        metadata
    }

    #[tokio::test]
    async fn test_builtin_handler() {
        let registry = Arc::new(HandlerRegistry::new().with(Arc::new(Echo)));
        let dispatcher = StepDispatcher::new(registry, Arc::new(MemoryMetadataStore::new()), None);

        let output = dispatcher
            .dispatch(&step(Some("test.echo")), input(), &state())
            .await
            .unwrap();
        assert_eq!(output, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_missing_module_is_permanent() {
        let dispatcher = StepDispatcher::new(
            Arc::new(HandlerRegistry::new()),
            Arc::new(MemoryMetadataStore::new()),
            None,
        );
        let err = dispatcher.dispatch(&step(None), input(), &state()).await.unwrap_err();
        assert!(!err.is_retryable());

        let err = dispatcher
            .dispatch(&step(Some("nobody")), input(), &state())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("nobody"));
    }

    #[tokio::test]
    async fn test_external_success() {
        let mut invoker = MockHandlerInvoker::new();
        invoker
            .expect_invoke()
            .withf(|registration, request| {
                registration.endpoint == "http://handlers/score"
                    && request.step_input.get("x") == Some(&json!(1))
                    && request.execution_state.flow_execution_id == "exec-1"
            })
            .times(1)
            .returning(|_, _| Ok(json!({"outputData": {"score": 7}})));

        let dispatcher = StepDispatcher::new(
            Arc::new(HandlerRegistry::new()),
            metadata_with_remote(),
            Some(Arc::new(invoker)),
        );
        let output = dispatcher
            .dispatch(&step(Some("remote.score")), input(), &state())
            .await
            .unwrap();
        assert_eq!(output, json!({"score": 7}));
    }

    #[tokio::test]
    async fn test_external_application_error_is_permanent() {
        let mut invoker = MockHandlerInvoker::new();
        invoker.expect_invoke().returning(|_, _| {
            Ok(json!({"errorName": "OrderRejected", "errorMessage": "credit limit"}))
        });

        let dispatcher = StepDispatcher::new(
            Arc::new(HandlerRegistry::new()),
            metadata_with_remote(),
            Some(Arc::new(invoker)),
        );
        let err = dispatcher
            .dispatch(&step(Some("remote.score")), input(), &state())
            .await
            .unwrap_err();

        let info = err.to_error_info();
        assert_eq!(info.error_name, "PermanentStepError");
        assert_eq!(info.error_message, "credit limit");
        assert_eq!(info.error_details.unwrap()["handlerErrorName"], "OrderRejected");
    }

    #[tokio::test]
    async fn test_transport_failure_is_transient() {
        let mut invoker = MockHandlerInvoker::new();
        invoker
            .expect_invoke()
            .returning(|_, _| Err(InvocationError::Transport("connection refused".to_string())));

        let dispatcher = StepDispatcher::new(
            Arc::new(HandlerRegistry::new()),
            metadata_with_remote(),
            Some(Arc::new(invoker)),
        );
        let err = dispatcher
            .dispatch(&step(Some("remote.score")), input(), &state())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.error_name(), "TransientStepError");
    }

    #[test]
    fn test_malformed_responses_are_transient() {
        assert!(interpret_response("m", json!("text")).unwrap_err().is_retryable());
        assert!(interpret_response("m", json!({"result": 1})).unwrap_err().is_retryable());
        assert_eq!(interpret_response("m", json!({"outputData": null})).unwrap(), Value::Null);
    }
}
