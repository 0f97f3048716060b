//! Rivulet Content Store
//!
//! Backends for the [`rivulet_core::ObjectStore`] port: a filesystem store
//! and an HTTP store. Both address objects as `container/key`, where keys
//! may contain `/` separated segments.

use rivulet_core::CoreError;
use thiserror::Error;

/// Errors that can occur during object store operations
#[derive(Error, Debug)]
pub enum ContentStoreError {
    #[error("Storage backend error: {0}")]
    BackendError(#[from] anyhow::Error),

    #[error("Object not found: {container}/{key}")]
    NotFound { container: String, key: String },

    #[error("Invalid object location: {0}")]
    InvalidLocation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for object store operations
pub type ContentStoreResult<T> = Result<T, ContentStoreError>;

impl From<ContentStoreError> for CoreError {
    fn from(err: ContentStoreError) -> Self {
        match err {
            ContentStoreError::ConfigurationError(msg) => CoreError::ConfigurationError(msg),
            other => CoreError::ObjectStoreError(other.to_string()),
        }
    }
}

/// Reject locations that could escape their container.
///
/// Containers are a single segment; keys are `/` separated segments, none
/// of which may be empty, `.` or `..`.
pub fn validate_location(container: &str, key: &str) -> ContentStoreResult<()> {
    let valid_segment = |segment: &str| {
        !segment.is_empty()
            && segment != "."
            && segment != ".."
            && !segment.contains('\\')
            && !segment.chars().any(char::is_control)
    };

    if container.contains('/') || !valid_segment(container) {
        return Err(ContentStoreError::InvalidLocation(format!(
            "container '{}'",
            container
        )));
    }
    if !key.split('/').all(valid_segment) {
        return Err(ContentStoreError::InvalidLocation(format!("key '{}'", key)));
    }
    Ok(())
}

/// Filesystem object store
pub mod fs;

/// HTTP object store
pub mod http;

pub use fs::FileObjectStore;
pub use http::HttpObjectStore;
