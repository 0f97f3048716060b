use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Core error type for the Rivulet interpreter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Malformed query expression
    #[error("Resolution error: {0}")]
    ResolutionError(String),

    /// Template rendering error
    #[error("Template error: {0}")]
    TemplateError(String),

    /// Template recursion exceeded the configured depth
    #[error("Template recursion depth exceeded: {0}")]
    TemplateDepthExceeded(String),

    /// Condition evaluation error
    #[error("Condition evaluation error: {0}")]
    ConditionEvaluationError(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Object store error
    #[error("Object store error: {0}")]
    ObjectStoreError(String),

    /// Continuation store error
    #[error("Continuation store error: {0}")]
    ContinuationStoreError(String),

    /// Metadata store error
    #[error("Metadata store error: {0}")]
    MetadataStoreError(String),

    /// Flow definition not found
    #[error("Flow definition not found: {0}")]
    FlowDefinitionNotFound(String),

    /// Step instance not found in the flow definition
    #[error("Step not found: {0}")]
    StepNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Whether the error comes from an external store that may recover on its own
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            CoreError::ObjectStoreError(_)
                | CoreError::ContinuationStoreError(_)
                | CoreError::MetadataStoreError(_)
        )
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Other(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}

/// Error names that denote transient infrastructure faults when reported
/// by an unclassified error.
const TRANSIENT_ERROR_NAMES: &[&str] = &[
    "ThrottlingException",
    "TooManyRequestsException",
    "ProvisionedThroughputExceededException",
    "RequestLimitExceeded",
    "ServiceUnavailable",
    "ServiceUnavailableException",
    "InternalServerError",
    "RequestTimeout",
    "TimeoutError",
];

/// A failure raised by a step handler, before classification.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepError {
    /// Non-retryable: bad config, business-rule violation, not-found
    #[error("{message}")]
    Permanent {
        /// Human readable message
        message: String,
        /// Optional structured details
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },

    /// Infrastructure fault that may succeed on retry
    #[error("{message}")]
    Transient {
        /// Human readable message
        message: String,
        /// Optional structured details
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },

    /// Uninterpretable content that may succeed verbatim on retry
    #[error("{message}")]
    ContentBasedRetryable {
        /// Human readable message
        message: String,
        /// Optional structured details
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },

    /// Any other failure, identified by its name
    #[error("{name}: {message}")]
    Unclassified {
        /// Error name as reported by the failing code
        name: String,
        /// Human readable message
        message: String,
    },
}

impl StepError {
    /// Create a permanent error
    pub fn permanent(message: impl Into<String>) -> Self {
        StepError::Permanent {
            message: message.into(),
            details: None,
        }
    }

    /// Create a permanent error with structured details
    pub fn permanent_with(message: impl Into<String>, details: Value) -> Self {
        StepError::Permanent {
            message: message.into(),
            details: Some(details),
        }
    }

    /// Create a transient error
    pub fn transient(message: impl Into<String>) -> Self {
        StepError::Transient {
            message: message.into(),
            details: None,
        }
    }

    /// Create a content-based retryable error
    pub fn content_retryable(message: impl Into<String>) -> Self {
        StepError::ContentBasedRetryable {
            message: message.into(),
            details: None,
        }
    }

    /// The name surfaced in `errorInfo.errorName`
    pub fn error_name(&self) -> &str {
        match self {
            StepError::Permanent { .. } => "PermanentStepError",
            StepError::Transient { .. } => "TransientStepError",
            StepError::ContentBasedRetryable { .. } => "ContentBasedRetryableError",
            StepError::Unclassified { name, .. } => name,
        }
    }

    /// Whether the orchestrator's retry channel applies.
    ///
    /// Unclassified errors are terminal unless their name is a recognised
    /// transient infrastructure fault.
    pub fn is_retryable(&self) -> bool {
        match self {
            StepError::Permanent { .. } => false,
            StepError::Transient { .. } | StepError::ContentBasedRetryable { .. } => true,
            StepError::Unclassified { name, .. } => TRANSIENT_ERROR_NAMES.contains(&name.as_str()),
        }
    }

    /// Collapse into the error shape seen above the dispatcher
    pub fn to_error_info(&self) -> ErrorInfo {
        let (message, details) = match self {
            StepError::Permanent { message, details }
            | StepError::Transient { message, details }
            | StepError::ContentBasedRetryable { message, details } => {
                (message.clone(), details.clone())
            }
            StepError::Unclassified { message, .. } => (message.clone(), None),
        };
        ErrorInfo {
            error_name: self.error_name().to_string(),
            error_message: message,
            error_details: details,
            is_retryable: self.is_retryable(),
        }
    }
}

impl From<CoreError> for StepError {
    fn from(err: CoreError) -> Self {
        let details = Some(json!({ "source": format!("{:?}", err) }));
        if err.is_infrastructure() {
            StepError::Transient {
                message: err.to_string(),
                details,
            }
        } else {
            StepError::Permanent {
                message: err.to_string(),
                details,
            }
        }
    }
}

/// User/operator-visible failure attached to the execution state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Error name, e.g. `PermanentStepError`
    pub error_name: String,
    /// Error message
    pub error_message: String,
    /// Optional structured details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<Value>,
    /// Whether the failure was tagged for retry
    pub is_retryable: bool,
}

impl ErrorInfo {
    /// Build a terminal error info with the given name
    pub fn terminal(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_name: name.into(),
            error_message: message.into(),
            error_details: None,
            is_retryable: false,
        }
    }
}
