//! Continuation lifecycle for wait-for-external-event steps
//!
//! Suspending renders the correlation key and saves a continuation record.
//! Resuming consumes the record with a single delete-and-get, so a given
//! key resumes at most once.

use crate::config::InterpreterConfig;
use crate::domain::continuation::ContinuationRecord;
use crate::domain::execution_state::ExecutionState;
use crate::domain::flow_definition::WaitConfig;
use crate::domain::repository::{ContinuationStore, ResumeSignal, SignalError};
use crate::expression::TemplateRenderer;
use crate::types::{serialized_size, Resolved};
use crate::{CoreError, StepError};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Why a resume request was refused
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResumeError {
    /// Payload exceeds the orchestrator's ceiling
    #[error("Payload of {size} bytes exceeds the limit of {limit} bytes")]
    PayloadTooLarge {
        /// Serialized payload size
        size: usize,
        /// Configured ceiling
        limit: usize,
    },

    /// Nothing is waiting on the correlation value
    #[error("No execution is waiting for: {0}")]
    NotFound(String),

    /// The orchestrator no longer accepts the resume token
    #[error("{0}")]
    TokenGone(SignalError),

    /// The resume signal could not be delivered
    #[error("{0}")]
    SignalFailed(SignalError),

    /// The continuation store failed
    #[error("{0}")]
    Store(CoreError),
}

impl ResumeError {
    /// HTTP status code reported to the external caller
    pub fn status_code(&self) -> u16 {
        match self {
            ResumeError::PayloadTooLarge { .. } => 413,
            ResumeError::NotFound(_) => 404,
            ResumeError::TokenGone(_) => 410,
            ResumeError::SignalFailed(_) => 502,
            ResumeError::Store(_) => 503,
        }
    }
}

/// Saves and consumes continuation records
#[derive(Clone)]
pub struct SuspensionManager {
    renderer: TemplateRenderer,
    store: Arc<dyn ContinuationStore>,
    default_ttl_seconds: u64,
    max_key_length: usize,
    max_payload_bytes: usize,
}

impl SuspensionManager {
    /// Create a manager
    pub fn new(
        renderer: TemplateRenderer,
        store: Arc<dyn ContinuationStore>,
        config: &InterpreterConfig,
    ) -> Self {
        Self {
            renderer,
            store,
            default_ttl_seconds: config.default_continuation_ttl_seconds,
            max_key_length: config.max_correlation_key_length,
            max_payload_bytes: config.max_payload_bytes,
        }
    }

    /// Render and validate the correlation key of a wait step.
    ///
    /// An unusable key is a permanent error: a continuation nobody can
    /// resume is worse than failing now.
    pub async fn correlation_key(&self, wait: &WaitConfig, scope: &Value) -> Result<String, StepError> {
        let rendered = self
            .renderer
            .render_str(&wait.correlation_key_template, scope)
            .await?;

        let key = match rendered {
            Resolved::Value(Value::String(s)) => s,
            Resolved::Value(Value::Number(n)) => n.to_string(),
            Resolved::Value(Value::Bool(b)) => b.to_string(),
            Resolved::Undefined | Resolved::Value(Value::Null) => {
                return Err(invalid_key(wait, "rendered to nothing"));
            }
            Resolved::Value(_) => {
                return Err(invalid_key(wait, "rendered to an object or array"));
            }
        };

        if key.trim().is_empty() {
            return Err(invalid_key(wait, "rendered to an empty string"));
        }
        if key.contains("{{") || key.contains("}}") {
            return Err(invalid_key(wait, "contains unresolved placeholders"));
        }
        if key.chars().any(char::is_control) {
            return Err(invalid_key(wait, "contains control characters"));
        }
        if key.len() > self.max_key_length {
            return Err(invalid_key(
                wait,
                &format!("is longer than {} bytes", self.max_key_length),
            ));
        }
        Ok(key)
    }

    /// Persist the continuation for a suspended wait step
    pub async fn suspend(
        &self,
        state: &ExecutionState,
        step_instance_id: &str,
        wait: &WaitConfig,
        resume_token: &str,
    ) -> Result<ContinuationRecord, StepError> {
        if resume_token.is_empty() {
            return Err(StepError::permanent("resume token must not be empty"));
        }

        let correlation_key = self.correlation_key(wait, &state.scope()).await?;
        let ttl_seconds = wait.max_wait_time_seconds.unwrap_or(self.default_ttl_seconds);
        let record = ContinuationRecord {
            correlation_key: correlation_key.clone(),
            resume_token: resume_token.to_string(),
            flow_execution_id: state.flow_execution_id.clone(),
            step_instance_id: step_instance_id.to_string(),
            created_at: Utc::now(),
            ttl_seconds,
        };

        self.store
            .put(&correlation_key, &record, Duration::from_secs(ttl_seconds))
            .await?;

        info!(
            flow_execution_id = %state.flow_execution_id,
            step_id = %step_instance_id,
            correlation_key = %correlation_key,
            ttl_seconds,
            "Execution suspended"
        );
        Ok(record)
    }

    /// Resume the execution waiting on `correlation_value`.
    ///
    /// The payload size is checked before the continuation is consumed.
    /// When the signal fails for any reason other than a dead token the
    /// continuation is put back so the caller can retry.
    pub async fn resume(
        &self,
        signal: &dyn ResumeSignal,
        correlation_value: &str,
        payload: &Value,
    ) -> Result<ContinuationRecord, ResumeError> {
        let size = serialized_size(payload).map_err(|e| ResumeError::Store(e.into()))?;
        if size > self.max_payload_bytes {
            warn!(correlation_key = %correlation_value, size, "Resume payload too large");
            return Err(ResumeError::PayloadTooLarge {
                size,
                limit: self.max_payload_bytes,
            });
        }

        let record = self
            .store
            .delete_and_get(correlation_value)
            .await
            .map_err(ResumeError::Store)?
            .ok_or_else(|| ResumeError::NotFound(correlation_value.to_string()))?;

        match signal.send_resume(&record.resume_token, payload).await {
            Ok(()) => {
                info!(
                    flow_execution_id = %record.flow_execution_id,
                    step_id = %record.step_instance_id,
                    correlation_key = %correlation_value,
                    "Execution resumed"
                );
                Ok(record)
            }
            Err(e) if e.is_token_gone() => {
                warn!(correlation_key = %correlation_value, error = %e, "Resume token no longer valid");
                Err(ResumeError::TokenGone(e))
            }
            Err(e) => {
                error!(correlation_key = %correlation_value, error = %e, "Resume signal failed, restoring continuation");
                let remaining = record
                    .expires_at()
                    .map(|expiry| (expiry - Utc::now()).num_seconds().max(1) as u64)
                    .unwrap_or(record.ttl_seconds);
                if let Err(restore) = self
                    .store
                    .put(correlation_value, &record, Duration::from_secs(remaining))
                    .await
                {
                    error!(correlation_key = %correlation_value, error = %restore, "Failed to restore continuation");
                }
                Err(ResumeError::SignalFailed(e))
            }
        }
    }
}

fn invalid_key(wait: &WaitConfig, problem: &str) -> StepError {
    StepError::permanent_with(
        format!("Correlation key {}", problem),
        json!({ "correlationKeyTemplate": wait.correlation_key_template }),
    )
}
