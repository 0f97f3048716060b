//! Configuration for the Rivulet Server
//!
//! Settings come from environment variables on top of serde defaults. The
//! interpreter's own tunables are read from `RIVULET_*` variables.

use rivulet_core::InterpreterConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use tracing::{info, warn};

use crate::error::{ServerError, ServerResult};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub bind_address: String,

    /// Log level or filter directive
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Directory of flow definitions (JSON or YAML)
    #[serde(default)]
    pub flows_dir: Option<String>,

    /// File listing external handler registrations (JSON or YAML)
    #[serde(default)]
    pub handlers_file: Option<String>,

    /// Base URL of an HTTP object store
    #[serde(default)]
    pub object_store_url: Option<String>,

    /// Bearer token for the HTTP object store
    #[serde(default)]
    pub object_store_token: Option<String>,

    /// Root directory of a filesystem object store
    #[serde(default)]
    pub object_store_dir: Option<String>,

    /// Orchestrator endpoint that accepts resume signals
    #[serde(default)]
    pub orchestrator_resume_url: Option<String>,

    /// Orchestrator endpoint that accepts flow-start messages
    #[serde(default)]
    pub orchestrator_start_url: Option<String>,

    /// Default timeout for external handler calls
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_seconds: u64,

    /// Interpreter tunables
    #[serde(default)]
    pub interpreter: InterpreterConfig,
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_handler_timeout() -> u64 {
    30
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn load() -> ServerResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> ServerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(port) = lookup("SERVER_PORT") {
            config.port = parse_var("SERVER_PORT", &port)?;
        }

        if let Some(host) = lookup("SERVER_HOST") {
            config.bind_address = host;
        }

        if let Some(log_level) = lookup("LOG_LEVEL") {
            config.log_level = log_level;
        }

        if let Some(format) = lookup("LOG_FORMAT") {
            config.log_format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" | "pretty" => LogFormat::Text,
                _ => {
                    warn!("Invalid LOG_FORMAT value: {}, using text", format);
                    LogFormat::Text
                }
            };
        }

        config.flows_dir = lookup("FLOWS_DIR");
        config.handlers_file = lookup("HANDLERS_FILE");
        config.object_store_url = lookup("OBJECT_STORE_URL");
        config.object_store_token = lookup("OBJECT_STORE_TOKEN");
        config.object_store_dir = lookup("OBJECT_STORE_DIR");
        config.orchestrator_resume_url = lookup("ORCHESTRATOR_RESUME_URL");
        config.orchestrator_start_url = lookup("ORCHESTRATOR_START_URL");

        if let Some(timeout) = lookup("HANDLER_TIMEOUT_SECONDS") {
            config.handler_timeout_seconds = parse_var("HANDLER_TIMEOUT_SECONDS", &timeout)?;
        }

        let interpreter = &mut config.interpreter;
        if let Some(value) = lookup("RIVULET_OFFLOAD_THRESHOLD_BYTES") {
            interpreter.offload_threshold_bytes = parse_var("RIVULET_OFFLOAD_THRESHOLD_BYTES", &value)?;
        }
        if let Some(value) = lookup("RIVULET_MAX_PAYLOAD_BYTES") {
            interpreter.max_payload_bytes = parse_var("RIVULET_MAX_PAYLOAD_BYTES", &value)?;
        }
        if let Some(value) = lookup("RIVULET_OBJECT_STORE_CONTAINER") {
            interpreter.object_store_container = value;
        }
        if let Some(value) = lookup("RIVULET_MAX_TEMPLATE_DEPTH") {
            interpreter.max_template_depth = parse_var("RIVULET_MAX_TEMPLATE_DEPTH", &value)?;
        }
        if let Some(value) = lookup("RIVULET_DEFAULT_CONTINUATION_TTL_SECONDS") {
            interpreter.default_continuation_ttl_seconds =
                parse_var("RIVULET_DEFAULT_CONTINUATION_TTL_SECONDS", &value)?;
        }
        if let Some(value) = lookup("RIVULET_MAX_RETRY_ATTEMPTS") {
            interpreter.max_retry_attempts = parse_var("RIVULET_MAX_RETRY_ATTEMPTS", &value)?;
        }
        if let Some(value) = lookup("RIVULET_MAX_CORRELATION_KEY_LENGTH") {
            interpreter.max_correlation_key_length =
                parse_var("RIVULET_MAX_CORRELATION_KEY_LENGTH", &value)?;
        }

        config.validate()?;

        if config.orchestrator_resume_url.is_none() {
            warn!("No ORCHESTRATOR_RESUME_URL provided - resume requests will fail with 502");
        }
        if config.orchestrator_start_url.is_none() {
            warn!("No ORCHESTRATOR_START_URL provided - sub-flow steps will fail");
        }

        info!("Loaded server configuration");
        Ok(config)
    }

    /// Reject settings that can never work
    pub fn validate(&self) -> ServerResult<()> {
        if self.object_store_url.is_some() && self.object_store_dir.is_some() {
            return Err(ServerError::ConfigError(
                "OBJECT_STORE_URL and OBJECT_STORE_DIR are mutually exclusive".to_string(),
            ));
        }
        if self.interpreter.object_store_container.trim().is_empty() {
            return Err(ServerError::ConfigError(
                "Object store container name is required".to_string(),
            ));
        }
        if self.interpreter.max_template_depth == 0 {
            return Err(ServerError::ConfigError(
                "Template depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> ServerResult<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ServerError::ConfigError(format!("Invalid {} value: {}", name, value)))
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_host(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            flows_dir: None,
            handlers_file: None,
            object_store_url: None,
            object_store_token: None,
            object_store_dir: None,
            orchestrator_resume_url: None,
            orchestrator_start_url: None,
            handler_timeout_seconds: default_handler_timeout(),
            interpreter: InterpreterConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> ServerResult<ServerConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.handler_timeout_seconds, 30);
        assert_eq!(config.interpreter, InterpreterConfig::default());
    }

    #[test]
    fn test_environment_overrides() {
        let config = load(&[
            ("SERVER_PORT", "9090"),
            ("LOG_FORMAT", "JSON"),
            ("FLOWS_DIR", "/etc/rivulet/flows"),
            ("OBJECT_STORE_DIR", "/var/lib/rivulet"),
            ("RIVULET_OFFLOAD_THRESHOLD_BYTES", "2048"),
            ("RIVULET_MAX_RETRY_ATTEMPTS", "5"),
            ("RIVULET_OBJECT_STORE_CONTAINER", "blobs"),
        ])
        .unwrap();

        assert_eq!(config.port, 9090);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.flows_dir.as_deref(), Some("/etc/rivulet/flows"));
        assert_eq!(config.object_store_dir.as_deref(), Some("/var/lib/rivulet"));
        assert_eq!(config.interpreter.offload_threshold_bytes, 2048);
        assert_eq!(config.interpreter.max_retry_attempts, 5);
        assert_eq!(config.interpreter.object_store_container, "blobs");
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            load(&[("SERVER_PORT", "eighty")]),
            Err(ServerError::ConfigError(_))
        ));
        assert!(matches!(
            load(&[("OBJECT_STORE_URL", "http://s3"), ("OBJECT_STORE_DIR", "/tmp")]),
            Err(ServerError::ConfigError(_))
        ));
        assert!(matches!(
            load(&[("RIVULET_MAX_TEMPLATE_DEPTH", "0")]),
            Err(ServerError::ConfigError(_))
        ));
    }
}
