//! Condition evaluation for skip conditions and branch conditions
//!
//! The router only depends on [`ConditionEvaluator`]; [`ExpressionEvaluator`]
//! is the built-in implementation for a small expression grammar:
//!
//! ```text
//! expr    := and ( ("||" | "or") and )*
//! and     := unary ( ("&&" | "and") unary )*
//! unary   := "!" unary | term
//! term    := "true" | "false" | "#" path | "#" path OP literal
//! OP      := "==" | "!=" | ">" | ">=" | "<" | "<="
//! literal := number | 'text' | "text" | true | false | null
//! ```
//!
//! `path` may be dotted (`#form.amount`) to reach nested values.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

/// Boolean evaluation of an expression against process variables.
///
/// Empty or invalid expressions evaluate to `false`; call sites apply their
/// own default when no expression is configured at all.
#[cfg_attr(test, mockall::automock)]
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, variables: &HashMap<String, Value>) -> bool;
}

static COMPARISON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^#([A-Za-z_][A-Za-z0-9_.]*)\s*(==|!=|>=|<=|>|<)\s*(.+)$")
        .expect("comparison pattern is valid")
});

static VARIABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^#([A-Za-z_][A-Za-z0-9_.]*)$").expect("variable pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "==" => CompareOp::Eq,
            "!=" => CompareOp::Ne,
            ">" => CompareOp::Gt,
            ">=" => CompareOp::Ge,
            "<" => CompareOp::Lt,
            "<=" => CompareOp::Le,
            _ => return None,
        })
    }
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Constant(bool),
    Truthy(String),
    Compare { path: String, op: CompareOp, literal: Value },
    Not(Box<Condition>),
    All(Vec<Condition>),
    Any(Vec<Condition>),
}

impl Condition {
    fn parse(expression: &str) -> Result<Self, String> {
        let alternatives = split_outside_quotes(expression, &["||", " or "]);
        if alternatives.len() > 1 {
            return alternatives
                .iter()
                .map(|part| Condition::parse_and(part))
                .collect::<Result<Vec<_>, _>>()
                .map(Condition::Any);
        }
        Condition::parse_and(expression)
    }

    fn parse_and(expression: &str) -> Result<Self, String> {
        let terms = split_outside_quotes(expression, &["&&", " and "]);
        if terms.len() > 1 {
            return terms
                .iter()
                .map(|part| Condition::parse_unary(part))
                .collect::<Result<Vec<_>, _>>()
                .map(Condition::All);
        }
        Condition::parse_unary(expression)
    }

    fn parse_unary(expression: &str) -> Result<Self, String> {
        let trimmed = expression.trim();
        if let Some(rest) = trimmed.strip_prefix('!') {
            return Ok(Condition::Not(Box::new(Condition::parse_unary(rest)?)));
        }

        match trimmed {
            "" => return Err("empty term".to_string()),
            "true" => return Ok(Condition::Constant(true)),
            "false" => return Ok(Condition::Constant(false)),
            _ => {}
        }

        if let Some(caps) = VARIABLE.captures(trimmed) {
            return Ok(Condition::Truthy(caps[1].to_string()));
        }

        let caps = COMPARISON
            .captures(trimmed)
            .ok_or_else(|| format!("unrecognised term '{}'", trimmed))?;
        let op = CompareOp::parse(&caps[2]).ok_or_else(|| format!("unknown operator '{}'", &caps[2]))?;

        Ok(Condition::Compare {
            path: caps[1].to_string(),
            op,
            literal: parse_literal(&caps[3])?,
        })
    }

    fn eval(&self, variables: &HashMap<String, Value>) -> Result<bool, String> {
        match self {
            Condition::Constant(b) => Ok(*b),
            Condition::Truthy(path) => lookup(variables, path)
                .map(truthy)
                .ok_or_else(|| format!("unknown variable '{}'", path)),
            Condition::Compare { path, op, literal } => match lookup(variables, path) {
                Some(value) => compare(value, *op, literal),
                None if literal.is_null() => match op {
                    CompareOp::Eq => Ok(true),
                    CompareOp::Ne => Ok(false),
                    _ => Err(format!("cannot order missing variable '{}'", path)),
                },
                None => Err(format!("unknown variable '{}'", path)),
            },
            Condition::Not(inner) => inner.eval(variables).map(|b| !b),
            Condition::All(terms) => {
                for term in terms {
                    if !term.eval(variables)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Any(terms) => {
                for term in terms {
                    if term.eval(variables)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

/// Split on any separator that is not inside a quoted string.
fn split_outside_quotes<'a>(input: &'a str, separators: &[&str]) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < input.len() {
        let rest = &input[i..];
        let Some(c) = rest.chars().next() else { break };

        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None => {
                if let Some(sep) = separators.iter().find(|sep| rest.starts_with(**sep)) {
                    parts.push(&input[start..i]);
                    i += sep.len();
                    start = i;
                    continue;
                }
            }
        }
        i += c.len_utf8();
    }
    parts.push(&input[start..]);
    parts
}

fn parse_literal(raw: &str) -> Result<Value, String> {
    let raw = raw.trim();
    for q in ['\'', '"'] {
        if raw.len() >= 2 && raw.starts_with(q) && raw.ends_with(q) {
            return Ok(Value::String(raw[1..raw.len() - 1].to_string()));
        }
    }
    match raw {
        "true" => Ok(Value::Bool(true)),
        "false" => Ok(Value::Bool(false)),
        "null" => Ok(Value::Null),
        _ => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("invalid literal '{}'", raw)),
    }
}

fn lookup<'a>(variables: &'a HashMap<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = variables.get(parts.next()?)?;
    for part in parts {
        current = match part.parse::<usize>() {
            Ok(index) => current.get(index)?,
            Err(_) => current.get(part)?,
        };
    }
    Some(current)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn compare(value: &Value, op: CompareOp, literal: &Value) -> Result<bool, String> {
    if let (Some(a), Some(b)) = (as_number(value), as_number(literal)) {
        if value.is_number() || literal.is_number() {
            return Ok(match op {
                CompareOp::Eq => a == b,
                CompareOp::Ne => a != b,
                CompareOp::Gt => a > b,
                CompareOp::Ge => a >= b,
                CompareOp::Lt => a < b,
                CompareOp::Le => a <= b,
            });
        }
    }

    match (value, literal) {
        (Value::String(a), Value::String(b)) => Ok(match op {
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
            CompareOp::Gt => a > b,
            CompareOp::Ge => a >= b,
            CompareOp::Lt => a < b,
            CompareOp::Le => a <= b,
        }),
        _ => match op {
            CompareOp::Eq => Ok(value == literal),
            CompareOp::Ne => Ok(value != literal),
            _ => Err(format!("cannot order {} against {}", value, literal)),
        },
    }
}

/// Built-in evaluator for the `#var OP literal` grammar.
#[derive(Debug, Clone, Default)]
pub struct ExpressionEvaluator;

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Check that an expression parses, without evaluating it.
    pub fn validate(expression: &str) -> Result<(), String> {
        Condition::parse(expression).map(|_| ())
    }
}

impl ConditionEvaluator for ExpressionEvaluator {
    fn evaluate(&self, expression: &str, variables: &HashMap<String, Value>) -> bool {
        if expression.trim().is_empty() {
            return false;
        }

        match Condition::parse(expression).and_then(|c| c.eval(variables)) {
            Ok(result) => result,
            Err(error) => {
                warn!(expression = %expression, error = %error, "Condition evaluation failed, treating as false");
                false
            }
        }
    }
}
