use crate::domain::repository::ObjectStore;
use crate::types::{LargeValuePointer, Resolved};
use crate::CoreError;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

lazy_static! {
    static ref FILTER_RE: Regex = Regex::new(r"\[\?\(\s*(.*?)\s*\)\]").unwrap();
    static ref DOUBLE_QUOTED_RE: Regex = Regex::new(r#""([^"]*)""#).unwrap();
    static ref LITERAL_OPERAND_RE: Regex =
        Regex::new(r"(<=|>=|==|!=|<|>)\s*(-?\d+(?:\.\d+)?|true|false|null)\b").unwrap();
}

/// Whether `expr` is a query expression rather than a literal
pub fn is_query(expr: &str) -> bool {
    expr == "$" || expr.starts_with("$.") || expr.starts_with("$[")
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Resolves query expressions against a JSON document, hydrating
/// large-value pointers from the object store on the way.
#[derive(Clone)]
pub struct ValueResolver {
    object_store: Arc<dyn ObjectStore>,
}

impl ValueResolver {
    /// Create a resolver reading offloaded values from `object_store`
    pub fn new(object_store: Arc<dyn ObjectStore>) -> Self {
        Self { object_store }
    }

    /// Resolve `expr` against `context`.
    ///
    /// Anything that is not a query expression is returned as a string
    /// literal. Missing data is [`Resolved::Undefined`]; only malformed
    /// expressions fail.
    pub async fn resolve(
        &self,
        expr: &str,
        context: &Value,
        hydrate: bool,
    ) -> Result<Resolved, CoreError> {
        if !is_query(expr) {
            return Ok(Resolved::Value(Value::String(expr.to_string())));
        }

        match parse_simple_path(expr) {
            Some(segments) => self.walk(&segments, context, hydrate).await,
            None => {
                let resolved = evaluate_jmespath(expr, context)?;
                match resolved {
                    Resolved::Value(value) if hydrate => Ok(Resolved::Value(self.hydrate(value).await?)),
                    other => Ok(other),
                }
            }
        }
    }

    /// Replace a large-value pointer with the value it points to.
    ///
    /// Values that are not pointers are returned unchanged.
    pub async fn hydrate(&self, value: Value) -> Result<Value, CoreError> {
        let Some(pointer) = LargeValuePointer::detect(&value) else {
            return Ok(value);
        };
        let location = &pointer.object_store_ref;
        debug!(container = %location.container, key = %location.key, "Hydrating large value");

        let bytes = self
            .object_store
            .get(&location.container, &location.key)
            .await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            CoreError::ObjectStoreError(format!(
                "offloaded value {}/{} is not valid JSON: {}",
                location.container, location.key, e
            ))
        })
    }

    async fn walk(
        &self,
        segments: &[Segment],
        context: &Value,
        hydrate: bool,
    ) -> Result<Resolved, CoreError> {
        let mut current = context.clone();
        for segment in segments {
            if hydrate {
                current = self.hydrate(current).await?;
            }
            let next = match (segment, &mut current) {
                (Segment::Key(key), Value::Object(map)) => map.remove(key),
                (Segment::Index(index), Value::Array(items)) if *index < items.len() => {
                    Some(items.swap_remove(*index))
                }
                _ => None,
            };
            match next {
                Some(value) => current = value,
                None => return Ok(Resolved::Undefined),
            }
        }
        if hydrate {
            current = self.hydrate(current).await?;
        }
        Ok(Resolved::Value(current))
    }
}

/// Parse `$`, `$.a.b`, `$.a[0]`, `$["k"]` style paths.
///
/// Returns `None` for anything needing the full query engine.
fn parse_simple_path(expr: &str) -> Option<Vec<Segment>> {
    let rest = expr.strip_prefix('$')?;
    let chars: Vec<char> = rest.chars().collect();
    let mut segments = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '.' => {
                i += 1;
                let start = i;
                while i < chars.len() && is_identifier_char(chars[i]) {
                    i += 1;
                }
                if start == i {
                    return None;
                }
                segments.push(Segment::Key(chars[start..i].iter().collect()));
            }
            '[' => {
                i += 1;
                match chars.get(i)? {
                    quote @ ('\'' | '"') => {
                        let quote = *quote;
                        i += 1;
                        let start = i;
                        while i < chars.len() && chars[i] != quote {
                            i += 1;
                        }
                        if i >= chars.len() {
                            return None;
                        }
                        let key: String = chars[start..i].iter().collect();
                        i += 1;
                        if chars.get(i) != Some(&']') {
                            return None;
                        }
                        i += 1;
                        segments.push(Segment::Key(key));
                    }
                    c if c.is_ascii_digit() => {
                        let start = i;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                        if chars.get(i) != Some(&']') {
                            return None;
                        }
                        let index = chars[start..i].iter().collect::<String>().parse().ok()?;
                        i += 1;
                        segments.push(Segment::Index(index));
                    }
                    _ => return None,
                }
            }
            _ => return None,
        }
    }

    Some(segments)
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-' || c == '$'
}

/// Rewrite a JSONPath-style query into JMESPath
fn to_jmespath(expr: &str) -> Result<String, CoreError> {
    if expr.contains("..") {
        return Err(CoreError::ResolutionError(format!(
            "recursive descent is not supported: {}",
            expr
        )));
    }

    let body = expr.strip_prefix('$').unwrap_or(expr);
    let body = body.strip_prefix('.').unwrap_or(body);
    if body.is_empty() {
        return Ok("@".to_string());
    }

    let translated = FILTER_RE.replace_all(body, |caps: &Captures| {
        format!("[?{}]", translate_predicate(&caps[1]))
    });
    Ok(translated.into_owned())
}

fn translate_predicate(predicate: &str) -> String {
    let predicate = predicate
        .replace("===", "==")
        .replace("!==", "!=")
        .replace("@.", "");
    let predicate = DOUBLE_QUOTED_RE.replace_all(&predicate, |caps: &Captures| {
        format!("'{}'", &caps[1])
    });
    LITERAL_OPERAND_RE
        .replace_all(&predicate, |caps: &Captures| {
            format!("{} `{}`", &caps[1], &caps[2])
        })
        .into_owned()
}

fn evaluate_jmespath(expr: &str, context: &Value) -> Result<Resolved, CoreError> {
    let query = to_jmespath(expr)?;
    let compiled = jmespath::compile(&query).map_err(|e| {
        CoreError::ResolutionError(format!("Failed to compile query {}: {}", expr, e))
    })?;
    let result = compiled.search(context).map_err(|e| {
        CoreError::ResolutionError(format!("Failed to evaluate query {}: {}", expr, e))
    })?;
    let value = serde_json::to_value(&*result)?;

    if value.is_null() {
        Ok(Resolved::Undefined)
    } else {
        Ok(Resolved::Value(value))
    }
}
