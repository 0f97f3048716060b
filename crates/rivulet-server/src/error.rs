//! Error types for the Rivulet Server

use rivulet_content_store::ContentStoreError;
use rivulet_core::CoreError;
use thiserror::Error;

/// Server error types
#[derive(Error, Debug)]
pub enum ServerError {
    /// Resource not found
    #[error("{0} not found")]
    NotFound(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A flow or handler file could not be parsed
    #[error("Definition parsing error: {0}")]
    DefinitionParsingError(String),

    /// Content store error
    #[error("Content store error: {0}")]
    ContentStoreError(String),

    /// Interpreter error
    #[error("Interpreter error: {0}")]
    InterpreterError(#[from] CoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Internal server error
    #[error("Internal server error: {0}")]
    InternalError(String),
}

/// Result type for server operations
pub type ServerResult<T> = Result<T, ServerError>;

impl From<ContentStoreError> for ServerError {
    fn from(err: ContentStoreError) -> Self {
        match err {
            ContentStoreError::ConfigurationError(msg) => ServerError::ConfigError(msg),
            other => ServerError::ContentStoreError(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(err: serde_json::Error) -> Self {
        ServerError::DefinitionParsingError(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for ServerError {
    fn from(err: serde_yaml::Error) -> Self {
        ServerError::DefinitionParsingError(format!("YAML error: {}", err))
    }
}

impl From<reqwest::Error> for ServerError {
    fn from(err: reqwest::Error) -> Self {
        ServerError::ConfigError(format!("HTTP client error: {}", err))
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::InternalError(format!("IO error: {}", err))
    }
}
