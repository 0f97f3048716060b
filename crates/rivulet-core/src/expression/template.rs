//! Two-pass template rendering
//!
//! Pass one interpolates `{{ expr }}` placeholders. Pass two resolves the
//! whole string when it is a query expression. A resolved string that
//! still needs rendering is rendered again, bounded by the configured
//! depth; a resolution that returns its own input stops the recursion.

use super::resolver::{is_query, ValueResolver};
use crate::types::Resolved;
use crate::CoreError;
use futures::future::{BoxFuture, FutureExt};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::warn;

lazy_static! {
    static ref PLACEHOLDER_RE: Regex = Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").unwrap();
}

/// Renders templates against a JSON scope
#[derive(Clone)]
pub struct TemplateRenderer {
    resolver: ValueResolver,
    max_depth: usize,
}

impl TemplateRenderer {
    /// Create a renderer
    pub fn new(resolver: ValueResolver, max_depth: usize) -> Self {
        Self {
            resolver,
            max_depth,
        }
    }

    /// Resolver used for placeholders and query strings
    pub fn resolver(&self) -> &ValueResolver {
        &self.resolver
    }

    /// Render any JSON value.
    ///
    /// Strings are rendered, arrays and objects are rendered element-wise
    /// and other primitives pass through. Undefined results drop object
    /// keys and become `null` inside arrays.
    pub async fn render(&self, template: &Value, scope: &Value) -> Result<Resolved, CoreError> {
        self.render_value(template.clone(), scope, 0).await
    }

    /// Render a single template string
    pub async fn render_str(&self, template: &str, scope: &Value) -> Result<Resolved, CoreError> {
        self.render_string(template.to_string(), scope, 0).await
    }

    fn render_value<'a>(
        &'a self,
        value: Value,
        scope: &'a Value,
        depth: usize,
    ) -> BoxFuture<'a, Result<Resolved, CoreError>> {
        async move {
            self.check_depth(depth)?;
            match value {
                Value::String(s) => self.render_string(s, scope, depth).await,
                Value::Array(items) => {
                    let mut rendered = Vec::with_capacity(items.len());
                    for item in items {
                        let value = self.render_value(item, scope, depth).await?;
                        rendered.push(value.into_value_or_null());
                    }
                    Ok(Resolved::Value(Value::Array(rendered)))
                }
                Value::Object(entries) => {
                    let mut rendered = Map::new();
                    for (key, item) in entries {
                        if let Resolved::Value(value) =
                            self.render_value(item, scope, depth).await?
                        {
                            rendered.insert(key, value);
                        }
                    }
                    Ok(Resolved::Value(Value::Object(rendered)))
                }
                other => Ok(Resolved::Value(other)),
            }
        }
        .boxed()
    }

    fn render_string<'a>(
        &'a self,
        template: String,
        scope: &'a Value,
        depth: usize,
    ) -> BoxFuture<'a, Result<Resolved, CoreError>> {
        async move {
            self.check_depth(depth)?;

            // Pass one: placeholders
            let interpolated = if is_single_placeholder(&template) {
                let expr = PLACEHOLDER_RE
                    .captures(&template)
                    .and_then(|caps| caps.get(1))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();
                match self.resolve_expression(&expr, scope).await? {
                    Some(resolved) => resolved,
                    None => Resolved::Value(Value::String(template.clone())),
                }
            } else if PLACEHOLDER_RE.is_match(&template) {
                Resolved::Value(Value::String(self.interpolate(&template, scope).await?))
            } else {
                Resolved::Value(Value::String(template.clone()))
            };

            // Pass two: whole-string query
            let resolved = match interpolated {
                Resolved::Value(Value::String(s)) if is_query(&s) => {
                    match self.resolver.resolve(&s, scope, true).await {
                        Ok(resolved) => resolved,
                        Err(e) if e.is_infrastructure() => return Err(e),
                        Err(e) => {
                            warn!(expression = %s, error = %e, "Unresolvable query in template, keeping literal text");
                            Resolved::Value(Value::String(s))
                        }
                    }
                }
                other => other,
            };

            match resolved {
                Resolved::Value(Value::String(next))
                    if next != template && needs_rendering(&next) =>
                {
                    self.render_string(next, scope, depth + 1).await
                }
                other => Ok(other),
            }
        }
        .boxed()
    }

    async fn interpolate(&self, template: &str, scope: &Value) -> Result<String, CoreError> {
        let mut output = String::with_capacity(template.len());
        let mut last = 0;
        for caps in PLACEHOLDER_RE.captures_iter(template) {
            let (Some(whole), Some(expr)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            output.push_str(&template[last..whole.start()]);
            match self.resolve_expression(expr.as_str(), scope).await? {
                Some(resolved) => output.push_str(&stringify(&resolved)),
                None => output.push_str(whole.as_str()),
            }
            last = whole.end();
        }
        output.push_str(&template[last..]);
        Ok(output)
    }

    /// Resolve a placeholder expression; `None` means it could not be
    /// resolved and the caller keeps the literal text.
    async fn resolve_expression(
        &self,
        expr: &str,
        scope: &Value,
    ) -> Result<Option<Resolved>, CoreError> {
        let query = if is_query(expr) {
            expr.to_string()
        } else {
            format!("$.{}", expr)
        };
        match self.resolver.resolve(&query, scope, true).await {
            Ok(resolved) => Ok(Some(resolved)),
            Err(e) if e.is_infrastructure() => Err(e),
            Err(e) => {
                warn!(expression = %expr, error = %e, "Unresolvable placeholder, keeping literal text");
                Ok(None)
            }
        }
    }

    fn check_depth(&self, depth: usize) -> Result<(), CoreError> {
        if depth > self.max_depth {
            Err(CoreError::TemplateDepthExceeded(format!(
                "exceeded maximum depth of {}",
                self.max_depth
            )))
        } else {
            Ok(())
        }
    }
}

fn is_single_placeholder(template: &str) -> bool {
    PLACEHOLDER_RE
        .find(template)
        .map(|m| m.start() == 0 && m.end() == template.len())
        .unwrap_or(false)
}

fn needs_rendering(s: &str) -> bool {
    is_query(s) || PLACEHOLDER_RE.is_match(s)
}

fn stringify(resolved: &Resolved) -> String {
    match resolved {
        Resolved::Undefined => String::new(),
        Resolved::Value(Value::String(s)) => s.clone(),
        Resolved::Value(other) => other.to_string(),
    }
}

#[cfg(all(test, feature = "testing"))]
mod tests {
    use super::*;
    use crate::domain::repository::memory::MemoryObjectStore;
    use crate::domain::repository::ObjectStore;
    use crate::types::LargeValuePointer;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn renderer_with(store: Arc<MemoryObjectStore>) -> TemplateRenderer {
        TemplateRenderer::new(ValueResolver::new(store), 10)
    }

    fn renderer() -> TemplateRenderer {
        renderer_with(Arc::new(MemoryObjectStore::new()))
    }

    fn scope() -> Value {
        json!({
            "customer": {"name": "Ada", "tier": 2},
            "orderId": "o-42",
            "tags": ["a", "b"],
            "alias": "$.customer.name",
            "loop": "$.loop",
            "ping": "$.pong",
            "pong": "$.ping"
        })
    }

    #[tokio::test]
    async fn test_interpolation_stringifies() {
        let rendered = renderer()
            .render_str("Hello {{customer.name}}, tier {{ $.customer.tier }} {{tags}}{{missing}}!", &scope())
            .await
            .unwrap();
        assert_eq!(rendered, Resolved::Value(json!("Hello Ada, tier 2 [\"a\",\"b\"]!")));
    }

    #[tokio::test]
    async fn test_single_placeholder_keeps_type() {
        let rendered = renderer().render_str("{{ customer }}", &scope()).await.unwrap();
        assert_eq!(rendered, Resolved::Value(json!({"name": "Ada", "tier": 2})));

        let missing = renderer().render_str("{{ nothing.here }}", &scope()).await.unwrap();
        assert!(missing.is_undefined());
    }

    #[tokio::test]
    async fn test_whole_string_query() {
        let rendered = renderer().render_str("$.customer.tier", &scope()).await.unwrap();
        assert_eq!(rendered, Resolved::Value(json!(2)));
    }

    #[tokio::test]
    async fn test_recursive_resolution() {
        let rendered = renderer().render_str("$.alias", &scope()).await.unwrap();
        assert_eq!(rendered, Resolved::Value(json!("Ada")));
    }

    #[tokio::test]
    async fn test_self_reference_stops() {
        let rendered = renderer().render_str("$.loop", &scope()).await.unwrap();
        assert_eq!(rendered, Resolved::Value(json!("$.loop")));
    }

    #[tokio::test]
    async fn test_cycle_exceeds_depth() {
        let err = renderer().render_str("$.ping", &scope()).await.unwrap_err();
        assert!(matches!(err, CoreError::TemplateDepthExceeded(_)));
    }

    #[tokio::test]
    async fn test_malformed_query_stays_literal() {
        let rendered = renderer().render_str("$.items[?(", &scope()).await.unwrap();
        assert_eq!(rendered, Resolved::Value(json!("$.items[?(")));
    }

    #[tokio::test]
    async fn test_structural_rendering() {
        let template = json!({
            "id": "{{orderId}}",
            "who": {"name": "$.customer.name", "nick": "{{customer.nick}}"},
            "list": ["{{missing}}", "$.orderId", 7, true],
            "plain": "text"
        });
        let rendered = renderer().render(&template, &scope()).await.unwrap();
        assert_eq!(
            rendered,
            Resolved::Value(json!({
                "id": "o-42",
                "who": {"name": "Ada"},
                "list": [null, "o-42", 7, true],
                "plain": "text"
            }))
        );
    }

    #[tokio::test]
    async fn test_deep_nesting_is_not_recursion() {
        let mut template = json!({"leaf": "$.customer.name", "fixed": "leaf"});
        let mut expected = json!({"leaf": "Ada", "fixed": "leaf"});
        for _ in 0..12 {
            template = json!({"n": [template]});
            expected = json!({"n": [expected]});
        }

        let rendered = renderer().render(&template, &scope()).await.unwrap();
        assert_eq!(rendered, Resolved::Value(expected));
    }

    #[tokio::test]
    async fn test_hydrates_pointer_in_query() {
        let store = Arc::new(MemoryObjectStore::new());
        store
            .put("c", "big.json", br#"{"total": 99}"#.to_vec())
            .await
            .unwrap();
        let scope = json!({"summary": LargeValuePointer::new("c", "big.json").to_value()});

        let rendered = renderer_with(store)
            .render_str("Total: {{ summary.total }}", &scope)
            .await
            .unwrap();
        assert_eq!(rendered, Resolved::Value(json!("Total: 99")));
    }
}
