//! Interpreter configuration
//!
//! Limits that protect the orchestrator's payload ceiling and bound the
//! resolution machinery. All fields have defaults so a partial document
//! (or none at all) is a valid configuration.

use serde::{Deserialize, Serialize};

/// Tunables for a [`crate::StepInterpreter`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterpreterConfig {
    /// Values whose serialized size exceeds this are offloaded to the object store
    #[serde(default = "default_offload_threshold")]
    pub offload_threshold_bytes: usize,

    /// Orchestrator payload ceiling, enforced on resume payloads
    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: usize,

    /// Object store container used for offloaded values
    #[serde(default = "default_container")]
    pub object_store_container: String,

    /// Maximum template recursion depth
    #[serde(default = "default_max_template_depth")]
    pub max_template_depth: usize,

    /// TTL for continuation records when the step sets no `maxWaitTimeSeconds`
    #[serde(default = "default_continuation_ttl")]
    pub default_continuation_ttl_seconds: u64,

    /// Retryable failures beyond this many attempts become terminal
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Longest accepted correlation key
    #[serde(default = "default_max_correlation_key_length")]
    pub max_correlation_key_length: usize,
}

fn default_offload_threshold() -> usize {
    32 * 1024
}

fn default_max_payload() -> usize {
    256 * 1024
}

fn default_container() -> String {
    "rivulet-large-values".to_string()
}

fn default_max_template_depth() -> usize {
    10
}

fn default_continuation_ttl() -> u64 {
    7 * 24 * 60 * 60 // 7 days
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_max_correlation_key_length() -> usize {
    512
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            offload_threshold_bytes: default_offload_threshold(),
            max_payload_bytes: default_max_payload(),
            object_store_container: default_container(),
            max_template_depth: default_max_template_depth(),
            default_continuation_ttl_seconds: default_continuation_ttl(),
            max_retry_attempts: default_max_retry_attempts(),
            max_correlation_key_length: default_max_correlation_key_length(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = InterpreterConfig::default();
        assert_eq!(config.offload_threshold_bytes, 32 * 1024);
        assert_eq!(config.default_continuation_ttl_seconds, 604_800);
        assert!(config.offload_threshold_bytes < config.max_payload_bytes);
    }

    #[test]
    fn test_partial_document() {
        let config: InterpreterConfig =
            serde_json::from_value(json!({"offloadThresholdBytes": 1024})).unwrap();
        assert_eq!(config.offload_threshold_bytes, 1024);
        assert_eq!(config.max_template_depth, 10);
        assert_eq!(config.object_store_container, "rivulet-large-values");
    }
}
