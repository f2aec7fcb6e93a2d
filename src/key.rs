//! Idempotency key expressions.
//!
//! A small JSONPath subset: `$` is the payload root, followed by any number of
//! `.field`, `['field']` or `[index]` segments. `$.id` and `$[0].messageId`
//! cover the scheduled and queue-driven triggers.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{Error, Result};

/// Key expression used when a workflow does not override it.
pub const DEFAULT_KEY_EXPRESSION: &str = "$.id";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
}

/// A parsed key expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExpression {
    source: String,
    segments: Vec<Segment>,
}

/// Why a payload did not yield a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The path does not exist in the payload.
    Missing,
    /// The path resolved to null, an empty string, or a non-scalar.
    Unusable(String),
}

impl std::fmt::Display for KeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyError::Missing => f.write_str("path not present in payload"),
            KeyError::Unusable(what) => write!(f, "path resolved to {what}"),
        }
    }
}

impl KeyExpression {
    pub fn parse(expression: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::KeyExpression {
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        let rest = expression
            .trim()
            .strip_prefix('$')
            .ok_or_else(|| invalid("must start with `$`"))?;
        let chars: Vec<char> = rest.chars().collect();
        let mut segments = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            match chars[i] {
                '.' => {
                    let start = i + 1;
                    let mut end = start;
                    while end < chars.len() && chars[end] != '.' && chars[end] != '[' {
                        end += 1;
                    }
                    if end == start {
                        return Err(invalid("empty field name"));
                    }
                    segments.push(Segment::Field(chars[start..end].iter().collect()));
                    i = end;
                }
                '[' => {
                    let close = chars[i..]
                        .iter()
                        .position(|&c| c == ']')
                        .map(|p| i + p)
                        .ok_or_else(|| invalid("unclosed `[`"))?;
                    let inner: String = chars[i + 1..close].iter().collect();
                    let inner = inner.trim();
                    let quoted = inner
                        .strip_prefix('\'')
                        .and_then(|s| s.strip_suffix('\''))
                        .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
                    match quoted {
                        Some(name) if !name.is_empty() => {
                            segments.push(Segment::Field(name.to_string()))
                        }
                        Some(_) => return Err(invalid("empty field name")),
                        None => {
                            let index = inner
                                .parse::<usize>()
                                .map_err(|_| invalid("index must be a non-negative integer"))?;
                            segments.push(Segment::Index(index));
                        }
                    }
                    i = close + 1;
                }
                _ => return Err(invalid("expected `.` or `[` after a segment")),
            }
        }

        Ok(Self {
            source: expression.trim().to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Select the value the expression points to.
    pub fn select<'a>(&self, payload: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(payload, |value, segment| match segment {
                Segment::Field(name) => value.get(name.as_str()),
                Segment::Index(index) => value.get(*index),
            })
    }

    /// Resolve the idempotency key. Strings are taken as-is, integers by their
    /// decimal text. Missing paths, null, empty strings, and structured values
    /// are rejected.
    pub fn extract(&self, payload: &Value) -> std::result::Result<String, KeyError> {
        match self.select(payload) {
            None => Err(KeyError::Missing),
            Some(Value::String(s)) if s.is_empty() => {
                Err(KeyError::Unusable("an empty string".to_string()))
            }
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
            Some(Value::Null) => Err(KeyError::Unusable("null".to_string())),
            Some(other) => Err(KeyError::Unusable(kind_of(other).to_string())),
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a non-integer number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl Default for KeyExpression {
    fn default() -> Self {
        Self {
            source: DEFAULT_KEY_EXPRESSION.to_string(),
            segments: vec![Segment::Field("id".to_string())],
        }
    }
}

impl std::fmt::Display for KeyExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for KeyExpression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for KeyExpression {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for KeyExpression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
