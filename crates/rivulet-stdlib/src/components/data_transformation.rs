use crate::required_str;
use async_trait::async_trait;
use rivulet_core::{HandlerRequest, StepError, StepHandler};
use serde_json::{Map, Value};
use tracing::debug;

/// Reshapes data with JMESPath expressions.
///
/// Inputs:
/// - `mapping`: an object whose string values starting with `$` are
///   expressions; any other value is copied literally. A bare string is
///   evaluated as a single expression.
/// - `data`: the document to query. Defaults to the whole input bag.
/// - `language`: only `jmespath` is supported.
#[derive(Debug, Default)]
pub struct MapData;

impl MapData {
    /// Module identifier
    pub const MODULE: &'static str = "StdLib:MapData";

    /// Create the handler
    pub fn new() -> Self {
        Self
    }

    fn evaluate(expression: &str, data: &Value) -> Result<Value, StepError> {
        let body = expression.strip_prefix('$').unwrap_or(expression);
        let body = body.strip_prefix('.').unwrap_or(body);
        let query = if body.is_empty() { "@" } else { body };

        let compiled = jmespath::compile(query).map_err(|e| {
            StepError::permanent(format!("Invalid JMESPath expression '{}': {}", expression, e))
        })?;
        let result = compiled.search(data).map_err(|e| {
            StepError::permanent(format!("Failed to evaluate '{}': {}", expression, e))
        })?;
        serde_json::to_value(&*result)
            .map_err(|e| StepError::permanent(format!("Failed to convert result: {}", e)))
    }

    fn apply_mapping(mapping: &Value, data: &Value) -> Result<Value, StepError> {
        match mapping {
            Value::String(expression) if expression.starts_with('$') => {
                Self::evaluate(expression, data)
            }
            Value::Object(fields) => {
                let mut result = Map::new();
                for (key, value) in fields {
                    result.insert(key.clone(), Self::apply_mapping(value, data)?);
                }
                Ok(Value::Object(result))
            }
            other => Ok(other.clone()),
        }
    }
}

#[async_trait]
impl StepHandler for MapData {
    fn module_identifier(&self) -> &str {
        Self::MODULE
    }

    async fn execute(&self, request: &HandlerRequest) -> Result<Value, StepError> {
        let input = &request.step_input;
        if input.contains_key("language") {
            let language = required_str(input, "language", Self::MODULE)?;
            if !language.eq_ignore_ascii_case("jmespath") {
                return Err(StepError::permanent(format!(
                    "Unsupported mapping language: {}",
                    language
                )));
            }
        }

        let mapping = input.get("mapping").ok_or_else(|| {
            StepError::permanent(format!("{} requires a 'mapping' input", Self::MODULE))
        })?;
        let data = match input.get("data") {
            Some(data) => data.clone(),
            None => Value::Object(input.clone()),
        };

        debug!(step = %request.step_definition.step_instance_id, "Applying data mapping");
        match mapping {
            Value::String(expression) => Self::evaluate(expression, &data),
            Value::Object(_) => Self::apply_mapping(mapping, &data),
            _ => Err(StepError::permanent("'mapping' must be an object or an expression")),
        }
    }
}
