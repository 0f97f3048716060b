use async_trait::async_trait;
use rivulet_core::{HandlerRequest, StepError, StepHandler};
use serde_json::{json, Value};
use uuid::Uuid;

/// Generates v4 UUIDs.
///
/// The optional `format` input selects `hyphenated` (default), `simple`,
/// `urn` or `braced`.
#[derive(Debug, Default)]
pub struct UuidGenerator;

impl UuidGenerator {
    /// Module identifier
    pub const MODULE: &'static str = "StdLib:UuidGenerator";

    /// Create the handler
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StepHandler for UuidGenerator {
    fn module_identifier(&self) -> &str {
        Self::MODULE
    }

    async fn execute(&self, request: &HandlerRequest) -> Result<Value, StepError> {
        let format = request
            .step_input
            .get("format")
            .and_then(Value::as_str)
            .unwrap_or("hyphenated");

        let id = Uuid::new_v4();
        let formatted = match format {
            "hyphenated" => id.hyphenated().to_string(),
            "simple" => id.simple().to_string(),
            "urn" => id.urn().to_string(),
            "braced" => id.braced().to_string(),
            other => {
                return Err(StepError::permanent_with(
                    format!("Unsupported UUID format: {}", other),
                    json!({"supportedFormats": ["hyphenated", "simple", "urn", "braced"]}),
                ))
            }
        };

        Ok(json!({
            "uuid": formatted,
            "version": 4,
            "format": format,
        }))
    }
}
