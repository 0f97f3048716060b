use crate::domain::repository::HandlerRequest;
use crate::StepError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// An in-process step handler
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Module identifier steps use to select this handler
    fn module_identifier(&self) -> &str;

    /// Run the handler; the returned value is the step output
    async fn execute(&self, request: &HandlerRequest) -> Result<Value, StepError>;
}

/// Explicit registry of in-process handlers, built at process start and
/// shared by reference.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its module identifier, replacing any previous one
    pub fn register(&mut self, handler: Arc<dyn StepHandler>) {
        self.handlers
            .insert(handler.module_identifier().to_string(), handler);
    }

    /// Builder-style [`HandlerRegistry::register`]
    pub fn with(mut self, handler: Arc<dyn StepHandler>) -> Self {
        self.register(handler);
        self
    }

    /// Look up a handler
    pub fn get(&self, module_identifier: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(module_identifier).cloned()
    }

    /// Whether a handler is registered
    pub fn contains(&self, module_identifier: &str) -> bool {
        self.handlers.contains_key(module_identifier)
    }

    /// Registered module identifiers, sorted
    pub fn module_identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
