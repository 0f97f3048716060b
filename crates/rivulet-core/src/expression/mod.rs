/// Query resolution with large-value hydration
pub mod resolver;

/// Two-pass template rendering
pub mod template;

/// Condition parsing and evaluation
pub mod condition;

pub use condition::ConditionEvaluator;
pub use resolver::{is_query, ValueResolver};
pub use template::TemplateRenderer;
