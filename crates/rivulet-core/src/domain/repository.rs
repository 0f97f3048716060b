//! Ports to the external collaborators of the interpreter
//!
//! The interpreter never persists anything itself. Object storage, flow and
//! handler metadata, continuation records, resume signalling, the flow-start
//! queue and external handler invocation are all reached through the traits
//! in this module. Hosts provide implementations; in-memory ones live in
//! [`memory`] behind the `testing` feature.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

use super::continuation::ContinuationRecord;
use super::execution_state::{ExecutionState, FlowStartMessage};
use super::flow_definition::{FlowDefinition, FlowId, StepInstance};
use crate::CoreError;

/// Byte-oriented object storage used for large-value offload
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes under `container/key`
    async fn put(&self, container: &str, key: &str, bytes: Vec<u8>) -> Result<(), CoreError>;

    /// Fetch the bytes under `container/key`
    async fn get(&self, container: &str, key: &str) -> Result<Vec<u8>, CoreError>;
}

/// Point lookups for flow definitions and external handler registrations
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Find a flow definition by id and version
    async fn get_flow_definition(
        &self,
        id: &FlowId,
        version: u32,
    ) -> Result<Option<FlowDefinition>, CoreError>;

    /// Find the registration of an external handler module
    async fn get_handler_registration(
        &self,
        module_identifier: &str,
    ) -> Result<Option<HandlerRegistration>, CoreError>;
}

/// Storage for continuation records with atomic consume
#[async_trait]
pub trait ContinuationStore: Send + Sync {
    /// Save a record under its correlation key
    async fn put(
        &self,
        correlation_key: &str,
        record: &ContinuationRecord,
        ttl: Duration,
    ) -> Result<(), CoreError>;

    /// Delete the record and return what was there, in one atomic operation.
    ///
    /// `None` means nothing is waiting on the key (never saved, expired or
    /// already consumed).
    async fn delete_and_get(
        &self,
        correlation_key: &str,
    ) -> Result<Option<ContinuationRecord>, CoreError>;
}

/// Failure reported by the orchestrator's resume primitive
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    /// The resume token has expired
    #[error("Resume token expired: {0}")]
    TokenExpired(String),

    /// The resume token is not recognised
    #[error("Resume token invalid: {0}")]
    InvalidToken(String),

    /// Any other failure to deliver the signal
    #[error("Resume signal failed: {0}")]
    Failed(String),
}

impl SignalError {
    /// Whether the token itself can never be used again
    pub fn is_token_gone(&self) -> bool {
        matches!(self, SignalError::TokenExpired(_) | SignalError::InvalidToken(_))
    }
}

/// The orchestrator's resume primitive
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResumeSignal: Send + Sync {
    /// Resume the execution behind `resume_token` with `payload` as the step output
    async fn send_resume(&self, resume_token: &str, payload: &Value) -> Result<(), SignalError>;
}

/// Asynchronous queue consumed by the orchestrator's start trigger
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FlowStartQueue: Send + Sync {
    /// Publish a start request
    async fn enqueue(&self, message: FlowStartMessage) -> Result<(), CoreError>;
}

/// Where and how an external handler module is invoked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerRegistration {
    /// Module identifier steps refer to
    pub module_identifier: String,
    /// RPC endpoint
    pub endpoint: String,
    /// Per-call timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// Request sent to an external handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerRequest {
    /// Step being executed
    pub step_definition: StepInstance,
    /// Resolved input bag
    pub step_input: Map<String, Value>,
    /// Current execution state
    pub execution_state: ExecutionState,
}

/// Failure to obtain any response from an external handler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvocationError {
    /// No response
    #[error("Handler transport failure: {0}")]
    Transport(String),

    /// Response could not be read
    #[error("Malformed handler response: {0}")]
    MalformedResponse(String),
}

/// RPC client for external handlers; synchronous request/response semantics
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HandlerInvoker: Send + Sync {
    /// Invoke the handler and return its raw JSON response
    async fn invoke(
        &self,
        registration: &HandlerRegistration,
        request: &HandlerRequest,
    ) -> Result<Value, InvocationError>;
}

/// Memory implementations for testing
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use dashmap::DashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    /// In-memory object store
    #[derive(Default)]
    pub struct MemoryObjectStore {
        objects: Arc<DashMap<(String, String), Vec<u8>>>,
    }

    impl MemoryObjectStore {
        /// Create an empty store
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of stored objects
        pub fn len(&self) -> usize {
            self.objects.len()
        }

        /// Whether the store is empty
        pub fn is_empty(&self) -> bool {
            self.objects.is_empty()
        }

        /// All stored keys of a container
        pub fn keys(&self, container: &str) -> Vec<String> {
            self.objects
                .iter()
                .filter(|entry| entry.key().0 == container)
                .map(|entry| entry.key().1.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryObjectStore {
        async fn put(&self, container: &str, key: &str, bytes: Vec<u8>) -> Result<(), CoreError> {
            self.objects
                .insert((container.to_string(), key.to_string()), bytes);
            Ok(())
        }

        async fn get(&self, container: &str, key: &str) -> Result<Vec<u8>, CoreError> {
            self.objects
                .get(&(container.to_string(), key.to_string()))
                .map(|bytes| bytes.clone())
                .ok_or_else(|| {
                    CoreError::ObjectStoreError(format!("object not found: {}/{}", container, key))
                })
        }
    }

    /// In-memory metadata store
    #[derive(Default)]
    pub struct MemoryMetadataStore {
        flows: DashMap<(String, u32), FlowDefinition>,
        handlers: DashMap<String, HandlerRegistration>,
    }

    impl MemoryMetadataStore {
        /// Create an empty store
        pub fn new() -> Self {
            Self::default()
        }

        /// Register a flow definition under its id and version
        pub fn insert_flow(&self, definition: FlowDefinition) {
            self.flows
                .insert((definition.id.0.clone(), definition.version), definition);
        }

        /// Register an external handler
        pub fn insert_handler(&self, registration: HandlerRegistration) {
            self.handlers
                .insert(registration.module_identifier.clone(), registration);
        }
    }

    #[async_trait]
    impl MetadataStore for MemoryMetadataStore {
        async fn get_flow_definition(
            &self,
            id: &FlowId,
            version: u32,
        ) -> Result<Option<FlowDefinition>, CoreError> {
            Ok(self
                .flows
                .get(&(id.0.clone(), version))
                .map(|flow| flow.clone()))
        }

        async fn get_handler_registration(
            &self,
            module_identifier: &str,
        ) -> Result<Option<HandlerRegistration>, CoreError> {
            Ok(self
                .handlers
                .get(module_identifier)
                .map(|registration| registration.clone()))
        }
    }

    /// In-memory continuation store with TTL expiry
    #[derive(Default)]
    pub struct MemoryContinuationStore {
        records: DashMap<String, (ContinuationRecord, Instant)>,
    }

    impl MemoryContinuationStore {
        /// Create an empty store
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of records held, expired ones included
        pub fn stored(&self) -> usize {
            self.records.len()
        }

        /// Number of live records
        pub fn len(&self) -> usize {
            let now = Instant::now();
            self.records
                .iter()
                .filter(|entry| entry.value().1 > now)
                .count()
        }

        /// Whether no live record exists
        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    #[async_trait]
    impl ContinuationStore for MemoryContinuationStore {
        async fn put(
            &self,
            correlation_key: &str,
            record: &ContinuationRecord,
            ttl: Duration,
        ) -> Result<(), CoreError> {
            let now = Instant::now();
            let expires_at = now
                .checked_add(ttl)
                .ok_or_else(|| CoreError::ContinuationStoreError("ttl out of range".to_string()))?;
            // Drop expired records nobody resumed
            self.records.retain(|_, (_, expires)| *expires > now);
            self.records
                .insert(correlation_key.to_string(), (record.clone(), expires_at));
            Ok(())
        }

        async fn delete_and_get(
            &self,
            correlation_key: &str,
        ) -> Result<Option<ContinuationRecord>, CoreError> {
            // DashMap::remove is atomic per key, so concurrent consumers race on it
            Ok(self
                .records
                .remove(correlation_key)
                .and_then(|(_, (record, expires_at))| {
                    if expires_at > Instant::now() {
                        Some(record)
                    } else {
                        None
                    }
                }))
        }
    }

    /// Flow-start queue that keeps every message
    #[derive(Default)]
    pub struct MemoryFlowStartQueue {
        messages: Mutex<Vec<FlowStartMessage>>,
    }

    impl MemoryFlowStartQueue {
        /// Create an empty queue
        pub fn new() -> Self {
            Self::default()
        }

        /// Messages published so far
        pub fn messages(&self) -> Vec<FlowStartMessage> {
            match self.messages.lock() {
                Ok(messages) => messages.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            }
        }
    }

    #[async_trait]
    impl FlowStartQueue for MemoryFlowStartQueue {
        async fn enqueue(&self, message: FlowStartMessage) -> Result<(), CoreError> {
            let mut messages = self
                .messages
                .lock()
                .map_err(|e| CoreError::Other(format!("queue lock poisoned: {}", e)))?;
            messages.push(message);
            Ok(())
        }
    }

    /// Resume signal that records every delivery and can be told to fail
    #[derive(Default)]
    pub struct RecordingResumeSignal {
        delivered: Mutex<Vec<(String, Value)>>,
        failure: Mutex<Option<SignalError>>,
    }

    impl RecordingResumeSignal {
        /// Create a signal that always succeeds
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every following delivery fail with `error`
        pub fn fail_with(&self, error: SignalError) {
            if let Ok(mut failure) = self.failure.lock() {
                *failure = Some(error);
            }
        }

        /// Deliveries so far, as `(resume_token, payload)`
        pub fn delivered(&self) -> Vec<(String, Value)> {
            self.delivered
                .lock()
                .map(|d| d.clone())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl ResumeSignal for RecordingResumeSignal {
        async fn send_resume(&self, resume_token: &str, payload: &Value) -> Result<(), SignalError> {
            let failure = self
                .failure
                .lock()
                .map_err(|e| SignalError::Failed(e.to_string()))?
                .clone();
            if let Some(error) = failure {
                return Err(error);
            }
            self.delivered
                .lock()
                .map_err(|e| SignalError::Failed(e.to_string()))?
                .push((resume_token.to_string(), payload.clone()));
            Ok(())
        }
    }
}
