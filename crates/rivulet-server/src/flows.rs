//! Loading flow definitions and handler registrations from disk
//!
//! Files ending in `.json`, `.yaml` or `.yml` are parsed by extension. Every
//! flow is validated before it is accepted, and a directory with any invalid
//! flow is rejected as a whole.

use rivulet_core::domain::repository::memory::MemoryMetadataStore;
use rivulet_core::{FlowDefinition, HandlerRegistration};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{ServerError, ServerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Yaml,
}

fn format_of(path: &Path) -> Option<Format> {
    match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
        "json" => Some(Format::Json),
        "yaml" | "yml" => Some(Format::Yaml),
        _ => None,
    }
}

async fn parse_file<T: DeserializeOwned>(path: &Path) -> ServerResult<T> {
    let format = format_of(path).ok_or_else(|| {
        ServerError::DefinitionParsingError(format!("{}: unsupported file extension", path.display()))
    })?;
    let text = tokio::fs::read_to_string(path).await?;
    let parsed = match format {
        Format::Json => serde_json::from_str(&text).map_err(ServerError::from),
        Format::Yaml => serde_yaml::from_str(&text).map_err(ServerError::from),
    };
    parsed.map_err(|e| ServerError::DefinitionParsingError(format!("{}: {}", path.display(), e)))
}

/// Parse and validate every flow definition in `dir`
pub async fn load_flows_dir(dir: impl AsRef<Path>) -> ServerResult<Vec<FlowDefinition>> {
    let dir = dir.as_ref();
    let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| {
        ServerError::ConfigError(format!("cannot read flows directory {}: {}", dir.display(), e))
    })?;

    let mut paths: Vec<PathBuf> = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && format_of(&path).is_some() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut seen = HashSet::new();
    let mut flows = Vec::with_capacity(paths.len());
    for path in paths {
        let flow: FlowDefinition = parse_file(&path).await?;
        flow.validate()
            .map_err(|e| ServerError::ValidationError(format!("{}: {}", path.display(), e)))?;

        if !seen.insert((flow.id.0.clone(), flow.version)) {
            return Err(ServerError::ValidationError(format!(
                "{}: duplicate flow {} v{}",
                path.display(),
                flow.id,
                flow.version
            )));
        }
        debug!(file = %path.display(), flow_id = %flow.id, version = flow.version, "Loaded flow definition");
        flows.push(flow);
    }
    Ok(flows)
}

/// Parse a list of external handler registrations
pub async fn load_handlers_file(path: impl AsRef<Path>) -> ServerResult<Vec<HandlerRegistration>> {
    let path = path.as_ref();
    let registrations: Vec<HandlerRegistration> = parse_file(path).await?;
    for registration in &registrations {
        if registration.module_identifier.is_empty() || registration.endpoint.is_empty() {
            return Err(ServerError::ValidationError(format!(
                "{}: handler registrations need a moduleIdentifier and an endpoint",
                path.display()
            )));
        }
    }
    Ok(registrations)
}

/// Build the metadata store from the configured locations
pub async fn load_metadata(
    flows_dir: Option<&str>,
    handlers_file: Option<&str>,
) -> ServerResult<MemoryMetadataStore> {
    let store = MemoryMetadataStore::new();

    let mut flow_count = 0;
    if let Some(dir) = flows_dir {
        for flow in load_flows_dir(dir).await? {
            store.insert_flow(flow);
            flow_count += 1;
        }
    }

    let mut handler_count = 0;
    if let Some(file) = handlers_file {
        for registration in load_handlers_file(file).await? {
            store.insert_handler(registration);
            handler_count += 1;
        }
    }

    info!(flows = flow_count, handlers = handler_count, "Loaded metadata");
    Ok(store)
}
