// SPDX-License-Identifier: PMPL-1.0-or-later
//! Bound parameter values.
//!
//! Every literal that reaches a [`QueryPlan`](crate::plan::QueryPlan) is a
//! [`Value`]; builders bind them as placeholders and never splice them into
//! query text.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schema::FieldType;

/// A literal bound to a placeholder in the compiled plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    /// An explicit NULL.
    Null,
    /// A boolean value.
    Bool(bool),
    /// A signed 64-bit integer.
    Int(i64),
    /// A 64-bit floating-point number.
    Float(f64),
    /// A UTF-8 string value.
    String(String),
    /// A resolved point in time (from `$NOW`).
    Timestamp(DateTime<Utc>),
    /// A list of values (`_in`, `_between`, `$CURRENT_ROLES`).
    List(Vec<Value>),
    /// An arbitrary JSON document compared against a json field.
    Json(serde_json::Value),
}

impl Value {
    /// Convert a raw JSON literal into a bound value.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(_) => Value::Json(json.clone()),
        }
    }

    /// JSON form of the value; timestamps become RFC 3339 strings.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Json(json) => json.clone(),
        }
    }

    /// Whether this is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The string payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Interpret the value as a boolean flag (`true`, `"true"`, `1`).
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
            Value::Int(1) => Some(true),
            Value::Int(0) => Some(false),
            _ => None,
        }
    }

    /// Coerce the value to the storage type of a field.
    ///
    /// Returns `None` when the value cannot represent the type, e.g. a
    /// non-numeric string compared against an integer column. Lists are
    /// coerced element-wise.
    pub fn coerce(&self, field_type: FieldType) -> Option<Value> {
        if let Value::List(items) = self {
            return items
                .iter()
                .map(|item| item.coerce(field_type))
                .collect::<Option<Vec<_>>>()
                .map(Value::List);
        }
        if self.is_null() {
            return Some(Value::Null);
        }

        match field_type {
            FieldType::Integer | FieldType::BigInteger => match self {
                Value::Int(i) => Some(Value::Int(*i)),
                Value::Float(f) if f.fract() == 0.0 => Some(Value::Int(*f as i64)),
                Value::String(s) => s.trim().parse().ok().map(Value::Int),
                _ => None,
            },
            FieldType::Float | FieldType::Decimal => match self {
                Value::Int(i) => Some(Value::Float(*i as f64)),
                Value::Float(f) => Some(Value::Float(*f)),
                Value::String(s) => s.trim().parse().ok().map(Value::Float),
                _ => None,
            },
            FieldType::Boolean => self.as_flag().map(Value::Bool),
            FieldType::Uuid => match self {
                Value::String(s) => uuid::Uuid::parse_str(s.trim())
                    .ok()
                    .map(|id| Value::String(id.hyphenated().to_string())),
                _ => None,
            },
            FieldType::Date | FieldType::Time | FieldType::DateTime | FieldType::Timestamp => {
                match self {
                    Value::String(_) | Value::Timestamp(_) => Some(self.clone()),
                    _ => None,
                }
            }
            FieldType::String | FieldType::Text | FieldType::Hash | FieldType::Csv => match self {
                Value::String(_) => Some(self.clone()),
                Value::Int(i) => Some(Value::String(i.to_string())),
                Value::Float(f) => Some(Value::String(f.to_string())),
                Value::Bool(b) => Some(Value::String(b.to_string())),
                _ => None,
            },
            FieldType::Json => Some(self.clone()),
            FieldType::Alias => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Json(json) => write!(f, "{}", json),
        }
    }
}
