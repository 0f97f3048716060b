//!
//! Standard library of step handlers for the Rivulet Platform
//!
//! Every handler implements [`rivulet_core::StepHandler`] and reads its
//! parameters from the step's resolved input bag, so static settings go in
//! `customConfig` or `literals` and dynamic ones in `inputMappings`.

use async_trait::async_trait;
use rivulet_core::{HandlerRegistry, HandlerRequest, StepError, StepHandler};
use serde_json::{Map, Value};
use std::sync::Arc;

pub mod components;

use crate::components::data_transformation::MapData;
use crate::components::http::HttpCall;
use crate::components::uuid::UuidGenerator;
use crate::components::validation::JsonSchemaValidator;

/// Module containing common handlers used in many flows
pub mod common {
    use super::*;

    /// Passes its input bag through as output
    #[derive(Debug, Default)]
    pub struct NoOp;

    impl NoOp {
        /// Module identifier
        pub const MODULE: &'static str = "StdLib:NoOp";

        /// Create the handler
        pub fn new() -> Self {
            Self
        }
    }

    #[async_trait]
    impl StepHandler for NoOp {
        fn module_identifier(&self) -> &str {
            Self::MODULE
        }

        async fn execute(&self, request: &HandlerRequest) -> Result<Value, StepError> {
            Ok(Value::Object(request.step_input.clone()))
        }
    }
}

/// Read a required string parameter from an input bag
pub(crate) fn required_str<'a>(
    input: &'a Map<String, Value>,
    name: &str,
    module: &str,
) -> Result<&'a str, StepError> {
    input.get(name).and_then(Value::as_str).ok_or_else(|| {
        StepError::permanent(format!("{} requires a string '{}' input", module, name))
    })
}

/// Registry construction
pub mod factory {
    use super::*;
    use crate::common::NoOp;

    /// Add every standard handler to `registry`
    pub fn register_all(registry: &mut HandlerRegistry) {
        registry.register(Arc::new(NoOp::new()));
        registry.register(Arc::new(MapData::new()));
        registry.register(Arc::new(UuidGenerator::new()));
        registry.register(Arc::new(JsonSchemaValidator::new()));
        registry.register(Arc::new(HttpCall::new()));
    }

    /// A registry holding every standard handler
    pub fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        register_all(&mut registry);
        registry
    }
}

pub use factory::{register_all, registry};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_contents() {
        let registry = registry();
        assert_eq!(
            registry.module_identifiers(),
            vec![
                "StdLib:HttpCall",
                "StdLib:JsonSchemaValidator",
                "StdLib:MapData",
                "StdLib:NoOp",
                "StdLib:UuidGenerator",
            ]
        );
        assert!(!registry.contains("StdLib:Unknown"));
    }
}
