use crate::config::InterpreterConfig;
use crate::domain::execution_state::ExecutionState;
use crate::domain::flow_definition::{InputMapping, OutputFormat, SourceMapping, StepInstance};
use crate::domain::repository::ObjectStore;
use crate::expression::{is_query, TemplateRenderer};
use crate::types::{LargeValuePointer, Resolved};
use crate::CoreError;
use sha2::{Digest, Sha256};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Moves data between the execution context and step inputs and outputs
#[derive(Clone)]
pub struct DataMapper {
    renderer: TemplateRenderer,
    object_store: Arc<dyn ObjectStore>,
    container: String,
    offload_threshold: usize,
}

impl DataMapper {
    /// Create a data mapper
    pub fn new(
        renderer: TemplateRenderer,
        object_store: Arc<dyn ObjectStore>,
        config: &InterpreterConfig,
    ) -> Self {
        Self {
            renderer,
            object_store,
            container: config.object_store_container.clone(),
            offload_threshold: config.offload_threshold_bytes,
        }
    }

    /// Renderer shared with the rest of the interpreter
    pub fn renderer(&self) -> &TemplateRenderer {
        &self.renderer
    }

    /// Assemble the input bag of a step.
    ///
    /// Precedence from low to high: flow defaults, `customConfig`,
    /// `literals`, mapped inputs.
    pub async fn resolve_input(
        &self,
        step: &StepInstance,
        default_step_config: &Map<String, Value>,
        scope: &Value,
    ) -> Result<Map<String, Value>, CoreError> {
        let mut input = default_step_config.clone();
        for (key, value) in &step.custom_config {
            input.insert(key.clone(), value.clone());
        }
        let mapped = self
            .resolve_mappings(&step.input_mappings, &step.literals, scope)
            .await?;
        input.extend(mapped);
        Ok(input)
    }

    /// Resolve literals and mappings into a bag; mapped values win and
    /// undefined ones are omitted.
    pub async fn resolve_mappings(
        &self,
        mappings: &BTreeMap<String, InputMapping>,
        literals: &Map<String, Value>,
        scope: &Value,
    ) -> Result<Map<String, Value>, CoreError> {
        let mut bag = literals.clone();
        for (destination, mapping) in mappings {
            match self.resolve_mapping(mapping, scope).await? {
                Resolved::Value(value) => {
                    bag.insert(destination.clone(), value);
                }
                Resolved::Undefined => {
                    debug!(destination = %destination, "Input mapping resolved to undefined, omitting");
                }
            }
        }
        Ok(bag)
    }

    async fn resolve_mapping(
        &self,
        mapping: &InputMapping,
        scope: &Value,
    ) -> Result<Resolved, CoreError> {
        match mapping {
            InputMapping::Template(template) => self.renderer.render(template, scope).await,
            InputMapping::Source(source) => {
                let resolved = if is_query(&source.source_path) {
                    self.renderer
                        .resolver()
                        .resolve(&source.source_path, scope, true)
                        .await?
                } else {
                    self.renderer.render_str(&source.source_path, scope).await?
                };
                Ok(format_resolved(source, resolved))
            }
        }
    }

    /// Fold a step output into the context through the step's output
    /// mappings. This is the only place the context changes.
    pub async fn apply_output(
        &self,
        state: &mut ExecutionState,
        mappings: &BTreeMap<String, Value>,
        output: &Value,
    ) -> Result<(), CoreError> {
        for (destination, source) in mappings {
            let value = match source {
                Value::String(path) if is_query(path) => {
                    match self.renderer.resolver().resolve(path, output, false).await? {
                        Resolved::Value(value) => value,
                        Resolved::Undefined => {
                            warn!(
                                flow_execution_id = %state.flow_execution_id,
                                destination = %destination,
                                source = %path,
                                "Output mapping source not found in step output, skipping"
                            );
                            continue;
                        }
                    }
                }
                literal => literal.clone(),
            };

            if destination == "$" {
                let Value::Object(entries) = value else {
                    warn!(destination = %destination, "Only objects can be merged into the context root");
                    continue;
                };
                for (key, item) in entries {
                    let item = self
                        .offload_if_large(&state.flow_execution_id, &key, item)
                        .await?;
                    state.current_context_data.insert(key, item);
                }
                continue;
            }

            let value = self
                .offload_if_large(&state.flow_execution_id, destination, value)
                .await?;
            set_path(&mut state.current_context_data, destination, value)?;
        }
        Ok(())
    }

    /// Replace `value` with a pointer to an object-store copy when its
    /// serialized size exceeds the threshold.
    ///
    /// Keys are content-addressed: `<flowExecutionId>/<destination>/<sha256>.json`.
    pub async fn offload_if_large(
        &self,
        flow_execution_id: &str,
        destination: &str,
        value: Value,
    ) -> Result<Value, CoreError> {
        if LargeValuePointer::detect(&value).is_some() {
            return Ok(value);
        }

        let bytes = serde_json::to_vec(&value)?;
        if bytes.len() <= self.offload_threshold {
            return Ok(value);
        }

        let digest = hex::encode(Sha256::digest(&bytes));
        let key = format!(
            "{}/{}/{}.json",
            flow_execution_id,
            sanitize_key_segment(destination),
            digest
        );
        let size = bytes.len();
        self.object_store.put(&self.container, &key, bytes).await?;

        info!(
            flow_execution_id = %flow_execution_id,
            destination = %destination,
            size,
            key = %key,
            "Offloaded large value to object store"
        );
        Ok(LargeValuePointer::new(self.container.clone(), key).to_value())
    }
}

fn format_resolved(source: &SourceMapping, resolved: Resolved) -> Resolved {
    match (source.format, resolved) {
        (OutputFormat::Join, Resolved::Value(Value::Array(items))) => {
            let separator = source.separator.as_deref().unwrap_or(",");
            let joined = items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(separator);
            Resolved::Value(Value::String(joined))
        }
        (_, resolved) => resolved,
    }
}

/// Write `value` at a plain key, dotted path or `$.` path, creating
/// intermediate objects.
fn set_path(
    context: &mut Map<String, Value>,
    destination: &str,
    value: Value,
) -> Result<(), CoreError> {
    let path = destination.strip_prefix("$.").unwrap_or(destination);
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(CoreError::ValidationError(format!(
            "invalid output mapping destination: {}",
            destination
        )));
    }

    let Some((last, parents)) = segments.split_last() else {
        return Ok(());
    };

    let mut current = context;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = match entry {
            Value::Object(map) => map,
            _ => {
                return Err(CoreError::Other(format!(
                    "cannot write through {} in {}",
                    segment, destination
                )))
            }
        };
    }
    current.insert(last.to_string(), value);
    Ok(())
}

fn sanitize_key_segment(destination: &str) -> String {
    let trimmed = destination.strip_prefix("$.").unwrap_or(destination);
    // "", "." and ".." are not valid object store segments
    if trimmed.chars().all(|c| c == '.') {
        return format!("_{}", trimmed.replace('.', "_"));
    }
    trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
