//! Condition evaluation
//!
//! Grammar: a bare query evaluated for truthiness, or
//! `<query> <op> <literal>`, joined with `&&`. There is no `||` and no
//! grouping. Unsupported operators evaluate to false with a warning.

use super::resolver::{is_query, ValueResolver};
use crate::types::Resolved;
use crate::CoreError;
use serde_json::Value;
use std::cmp::Ordering;
use tracing::{debug, warn};

const OPERATOR_CHARS: &[char] = &['<', '>', '=', '!', '~'];

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `<`
    Lt,
    /// `>`
    Gt,
    /// `<=`
    Le,
    /// `>=`
    Ge,
    /// `==` and `=`
    LooseEq,
    /// `===`
    StrictEq,
    /// `!=`
    LooseNe,
    /// `!==`
    StrictNe,
}

impl Operator {
    /// Parse an operator token
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "<" => Some(Operator::Lt),
            ">" => Some(Operator::Gt),
            "<=" => Some(Operator::Le),
            ">=" => Some(Operator::Ge),
            "==" | "=" => Some(Operator::LooseEq),
            "===" => Some(Operator::StrictEq),
            "!=" => Some(Operator::LooseNe),
            "!==" => Some(Operator::StrictNe),
            _ => None,
        }
    }

    /// Apply the operator
    pub fn apply(self, left: &Resolved, right: &Resolved) -> bool {
        match self {
            Operator::LooseEq => loose_eq(left, right),
            Operator::LooseNe => !loose_eq(left, right),
            Operator::StrictEq => strict_eq(left, right),
            Operator::StrictNe => !strict_eq(left, right),
            Operator::Lt => compare(left, right) == Some(Ordering::Less),
            Operator::Gt => compare(left, right) == Some(Ordering::Greater),
            Operator::Le => matches!(compare(left, right), Some(Ordering::Less | Ordering::Equal)),
            Operator::Ge => matches!(
                compare(left, right),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        }
    }
}

/// Evaluates transition and gate conditions
#[derive(Clone)]
pub struct ConditionEvaluator {
    resolver: ValueResolver,
}

impl ConditionEvaluator {
    /// Create an evaluator
    pub fn new(resolver: ValueResolver) -> Self {
        Self { resolver }
    }

    /// Evaluate `condition` against `scope`, short-circuiting on the first
    /// false conjunct.
    pub async fn evaluate(&self, condition: &str, scope: &Value) -> Result<bool, CoreError> {
        let conjuncts = split_conjuncts(condition);
        if conjuncts.iter().all(|c| c.trim().is_empty()) {
            warn!(condition = %condition, "Empty condition evaluates to false");
            return Ok(false);
        }

        for conjunct in conjuncts {
            if !self.evaluate_single(conjunct.trim(), scope).await? {
                debug!(condition = %condition, failed = %conjunct.trim(), "Condition is false");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn evaluate_single(&self, expr: &str, scope: &Value) -> Result<bool, CoreError> {
        let Some((left, op, right)) = split_comparison(expr) else {
            let operand = self.operand(expr, scope).await?;
            return Ok(operand.is_truthy());
        };

        let Some(operator) = Operator::parse(op) else {
            warn!(condition = %expr, operator = %op, "Unsupported operator, condition is false");
            return Ok(false);
        };

        let left = self.operand(left.trim(), scope).await?;
        let right = parse_literal(right.trim());
        Ok(operator.apply(&left, &right))
    }

    async fn operand(&self, expr: &str, scope: &Value) -> Result<Resolved, CoreError> {
        if is_query(expr) {
            self.resolver.resolve(expr, scope, true).await
        } else {
            Ok(parse_literal(expr))
        }
    }
}

/// Split on `&&` outside quotes and brackets
fn split_conjuncts(condition: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth: i32 = 0;
    let mut quote: Option<char> = None;
    let mut start = 0;
    let bytes = condition.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' => quote = Some(c),
                '[' | '(' => depth += 1,
                ']' | ')' => depth -= 1,
                '&' if depth == 0 && bytes.get(i + 1) == Some(&b'&') => {
                    parts.push(&condition[start..i]);
                    i += 2;
                    start = i;
                    continue;
                }
                _ => {}
            },
        }
        i += 1;
    }
    parts.push(&condition[start..]);
    parts
}

/// Find the first operator run outside quotes and brackets
fn split_comparison(expr: &str) -> Option<(&str, &str, &str)> {
    let mut depth: i32 = 0;
    let mut quote: Option<char> = None;

    for (i, c) in expr.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' => quote = Some(c),
                '[' | '(' => depth += 1,
                ']' | ')' => depth -= 1,
                c if depth == 0 && OPERATOR_CHARS.contains(&c) => {
                    let end = expr[i..]
                        .char_indices()
                        .find(|(_, c)| !OPERATOR_CHARS.contains(c))
                        .map(|(offset, _)| i + offset)
                        .unwrap_or(expr.len());
                    return Some((&expr[..i], &expr[i..end], &expr[end..]));
                }
                _ => {}
            },
        }
    }
    None
}

/// Parse a literal operand
pub fn parse_literal(token: &str) -> Resolved {
    match token {
        "true" => return Resolved::Value(Value::Bool(true)),
        "false" => return Resolved::Value(Value::Bool(false)),
        "null" => return Resolved::Value(Value::Null),
        "undefined" => return Resolved::Undefined,
        _ => {}
    }

    if token.len() >= 2 {
        let first = token.as_bytes()[0];
        let last = token.as_bytes()[token.len() - 1];
        if (first == b'\'' || first == b'"') && first == last {
            return Resolved::Value(Value::String(token[1..token.len() - 1].to_string()));
        }
    }

    if let Ok(number @ Value::Number(_)) = serde_json::from_str::<Value>(token) {
        return Resolved::Value(number);
    }

    Resolved::Value(Value::String(token.to_string()))
}

fn to_number(resolved: &Resolved) -> f64 {
    match resolved {
        Resolved::Undefined => f64::NAN,
        Resolved::Value(value) => match value {
            Value::Null => 0.0,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    trimmed.parse().unwrap_or(f64::NAN)
                }
            }
            Value::Array(_) | Value::Object(_) => f64::NAN,
        },
    }
}

fn is_nullish(resolved: &Resolved) -> bool {
    matches!(resolved, Resolved::Undefined | Resolved::Value(Value::Null))
}

/// JavaScript `==`, with structural equality for arrays and objects
fn loose_eq(left: &Resolved, right: &Resolved) -> bool {
    if is_nullish(left) || is_nullish(right) {
        return is_nullish(left) && is_nullish(right);
    }
    match (left, right) {
        (Resolved::Value(Value::Bool(_)), _) | (_, Resolved::Value(Value::Bool(_))) => {
            to_number(left) == to_number(right)
        }
        (Resolved::Value(Value::Number(_)), Resolved::Value(Value::String(_)))
        | (Resolved::Value(Value::String(_)), Resolved::Value(Value::Number(_))) => {
            to_number(left) == to_number(right)
        }
        _ => strict_eq(left, right),
    }
}

/// JavaScript `===`, with structural equality for arrays and objects
fn strict_eq(left: &Resolved, right: &Resolved) -> bool {
    match (left, right) {
        (Resolved::Undefined, Resolved::Undefined) => true,
        (Resolved::Value(Value::Number(a)), Resolved::Value(Value::Number(b))) => {
            match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
        (Resolved::Value(a), Resolved::Value(b)) => a == b,
        _ => false,
    }
}

/// JavaScript relational comparison; `None` when incomparable
fn compare(left: &Resolved, right: &Resolved) -> Option<Ordering> {
    if let (Resolved::Value(Value::String(a)), Resolved::Value(Value::String(b))) = (left, right) {
        return Some(a.cmp(b));
    }
    to_number(left).partial_cmp(&to_number(right))
}
