use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tasklane_core::chain::ChainStatus;
use tasklane_core::error::{Result, TasklaneError};

use crate::context::FlowContext;

/// Boolean guard on an edge, evaluated against the live `FlowContext`.
///
/// Predicates are parsed when the flow is built and never executed as code.
/// Grammar:
/// - `true`, `false`, `hasCurrentStep`
/// - `not(p)`, `all(p, ...)`, `any(p, ...)`
/// - `chainStatus == "executing"`, `chainStatus != "failed"`
/// - `key == "value"`, `key != "value"`, `key contains "substr"`
/// - `exists(key)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Predicate {
    True,
    False,
    HasCurrentStep,
    Not(Box<Predicate>),
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    ChainStatusIs(ChainStatus),
    Equals { key: String, value: String },
    NotEquals { key: String, value: String },
    Contains { key: String, value: String },
    Exists(String),
}

impl Predicate {
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();

        match expr {
            "true" => return Ok(Self::True),
            "false" => return Ok(Self::False),
            "hasCurrentStep" => return Ok(Self::HasCurrentStep),
            _ => {}
        }

        if let Some(inner) = call_args(expr, "not") {
            return Ok(Self::Not(Box::new(Self::parse(inner)?)));
        }
        if let Some(inner) = call_args(expr, "all") {
            return Ok(Self::All(parse_list(expr, inner)?));
        }
        if let Some(inner) = call_args(expr, "any") {
            return Ok(Self::Any(parse_list(expr, inner)?));
        }
        if let Some(inner) = call_args(expr, "exists") {
            let key = inner.trim();
            if !is_identifier(key) {
                return Err(invalid(expr));
            }
            return Ok(Self::Exists(key.to_string()));
        }

        // `contains` is a word operator and needs surrounding spaces.
        for op in [" contains ", "!=", "=="] {
            if let Some((key, value)) = split_operator(expr, op) {
                return binary(expr, op.trim(), key, value);
            }
        }

        Err(invalid(expr))
    }

    pub fn not(p: Predicate) -> Self {
        Self::Not(Box::new(p))
    }

    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Equals {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Evaluate against the context's chain and variables.
    ///
    /// Comparisons against a missing (or null) variable are false, including
    /// `!=`.
    pub fn evaluate(&self, context: &FlowContext) -> bool {
        match self {
            Self::True => true,
            Self::False => false,
            Self::HasCurrentStep => context.current_step().is_some(),
            Self::Not(p) => !p.evaluate(context),
            Self::All(ps) => ps.iter().all(|p| p.evaluate(context)),
            Self::Any(ps) => ps.iter().any(|p| p.evaluate(context)),
            Self::ChainStatusIs(status) => context.chain().status == *status,
            Self::Equals { key, value } => var_text(context, key).is_some_and(|s| s == *value),
            Self::NotEquals { key, value } => var_text(context, key).is_some_and(|s| s != *value),
            Self::Contains { key, value } => {
                var_text(context, key).is_some_and(|s| s.contains(value.as_str()))
            }
            Self::Exists(key) => context.get(key).is_some_and(|v| !v.is_null()),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => f.write_str("true"),
            Self::False => f.write_str("false"),
            Self::HasCurrentStep => f.write_str("hasCurrentStep"),
            Self::Not(p) => write!(f, "not({})", p),
            Self::All(ps) => write!(f, "all({})", join(ps)),
            Self::Any(ps) => write!(f, "any({})", join(ps)),
            Self::ChainStatusIs(status) => write!(f, "chainStatus == \"{}\"", status),
            Self::Equals { key, value } => write!(f, "{} == \"{}\"", key, value),
            Self::NotEquals { key, value } => write!(f, "{} != \"{}\"", key, value),
            Self::Contains { key, value } => write!(f, "{} contains \"{}\"", key, value),
            Self::Exists(key) => write!(f, "exists({})", key),
        }
    }
}

impl FromStr for Predicate {
    type Err = TasklaneError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Predicate {
    type Error = TasklaneError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Predicate> for String {
    fn from(p: Predicate) -> Self {
        p.to_string()
    }
}

fn invalid(expr: &str) -> TasklaneError {
    TasklaneError::InvalidFlow(format!("unrecognized condition: {}", expr))
}

fn join(ps: &[Predicate]) -> String {
    ps.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ")
}

fn var_text<'a>(context: &'a FlowContext, key: &str) -> Option<std::borrow::Cow<'a, str>> {
    match context.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(std::borrow::Cow::Borrowed(s.as_str())),
        other => Some(std::borrow::Cow::Owned(other.to_string())),
    }
}

fn binary(expr: &str, op: &str, key: &str, value: &str) -> Result<Predicate> {
    let key = key.trim();
    let value = string_literal(value.trim()).ok_or_else(|| invalid(expr))?;
    if !is_identifier(key) {
        return Err(invalid(expr));
    }

    if key == "chainStatus" {
        let status: ChainStatus = value.parse().map_err(TasklaneError::InvalidFlow)?;
        return match op {
            "==" => Ok(Predicate::ChainStatusIs(status)),
            "!=" => Ok(Predicate::not(Predicate::ChainStatusIs(status))),
            _ => Err(invalid(expr)),
        };
    }

    let (key, value) = (key.to_string(), value.to_string());
    Ok(match op {
        "==" => Predicate::Equals { key, value },
        "!=" => Predicate::NotEquals { key, value },
        _ => Predicate::Contains { key, value },
    })
}

fn parse_list(expr: &str, inner: &str) -> Result<Vec<Predicate>> {
    let parts = split_top_level(inner);
    if parts.iter().all(|p| p.trim().is_empty()) {
        return Err(invalid(expr));
    }
    parts.into_iter().map(Predicate::parse).collect()
}

/// `name(args)` with the closing paren matching the opening one.
fn call_args<'a>(expr: &'a str, name: &str) -> Option<&'a str> {
    let rest = expr.strip_prefix(name)?.trim_start();
    if !rest.starts_with('(') {
        return None;
    }

    let mut depth = 0usize;
    let mut in_quote = false;
    for (i, c) in rest.char_indices() {
        match c {
            '"' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => {
                depth -= 1;
                if depth == 0 {
                    return (i == rest.len() - 1).then(|| &rest[1..i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on commas that are outside parentheses and quotes.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut start = 0;

    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => depth = depth.saturating_sub(1),
            ',' if !in_quote && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Split `key OP "value"` at the first operator outside quotes.
fn split_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let mut in_quote = false;
    for (i, c) in expr.char_indices() {
        if c == '"' {
            in_quote = !in_quote;
        } else if !in_quote && expr[i..].starts_with(op) {
            return Some((&expr[..i], &expr[i + op.len()..]));
        }
    }
    None
}

fn string_literal(s: &str) -> Option<&str> {
    let inner = s.strip_prefix('"')?.strip_suffix('"')?;
    (!inner.contains('"')).then_some(inner)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}
