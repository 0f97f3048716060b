use async_trait::async_trait;
use jsonschema::{Draft, JSONSchema};
use rivulet_core::{HandlerRequest, StepError, StepHandler};
use serde_json::{json, Value};
use tracing::debug;

/// Validates data against a JSON Schema (draft 7).
///
/// Inputs are `schema` and `data`. With `failOnInvalid` left at its default
/// of `true` an invalid document fails the step permanently and the
/// violations are reported in `errorInfo.errorDetails.validationErrors`;
/// otherwise they are returned as output.
#[derive(Debug, Default)]
pub struct JsonSchemaValidator;

impl JsonSchemaValidator {
    /// Module identifier
    pub const MODULE: &'static str = "StdLib:JsonSchemaValidator";

    /// Create the handler
    pub fn new() -> Self {
        Self
    }

    /// Collect every violation of `schema` in `data`
    pub fn violations(schema: &Value, data: &Value) -> Result<Vec<Value>, StepError> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(schema)
            .map_err(|e| StepError::permanent(format!("Invalid JSON schema: {}", e)))?;

        let violations = match compiled.validate(data) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|error| {
                    json!({
                        "field": error.instance_path.to_string(),
                        "message": error.to_string(),
                        "keyword": format!("{:?}", error.kind),
                    })
                })
                .collect(),
        };
        Ok(violations)
    }
}

#[async_trait]
impl StepHandler for JsonSchemaValidator {
    fn module_identifier(&self) -> &str {
        Self::MODULE
    }

    async fn execute(&self, request: &HandlerRequest) -> Result<Value, StepError> {
        let input = &request.step_input;
        let schema = input.get("schema").ok_or_else(|| {
            StepError::permanent(format!("{} requires a 'schema' input", Self::MODULE))
        })?;
        let data = input.get("data").cloned().unwrap_or(Value::Null);
        let fail_on_invalid = input
            .get("failOnInvalid")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let violations = Self::violations(schema, &data)?;
        if violations.is_empty() {
            return Ok(json!({"valid": true, "data": data}));
        }

        debug!(count = violations.len(), "Schema validation failed");
        if fail_on_invalid {
            Err(StepError::permanent_with(
                format!("Data failed schema validation with {} error(s)", violations.len()),
                json!({"validationErrors": violations}),
            ))
        } else {
            Ok(json!({"valid": false, "validationErrors": violations}))
        }
    }
}
