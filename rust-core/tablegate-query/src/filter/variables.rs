// SPDX-License-Identifier: PMPL-1.0-or-later
//! Dynamic filter variables.
//!
//! `$NOW`, `$NOW(<offset>)`, `$CURRENT_USER[.path]`, `$CURRENT_ROLE[.path]`
//! and `$CURRENT_ROLES` are replaced by plain values while the filter is
//! parsed, so no compiled plan ever refers back to session state.

use std::sync::OnceLock;

use chrono::{DateTime, Duration, Months, Utc};
use regex::Regex;
use serde_json::{Map, Value as JsonValue};

use crate::accountability::Accountability;
use crate::error::{QueryError, Result};
use crate::value::Value;

static NOW_OFFSET: OnceLock<Regex> = OnceLock::new();

fn now_offset() -> &'static Regex {
    NOW_OFFSET.get_or_init(|| {
        Regex::new(r"^\$NOW\(\s*(?P<sign>[+-]?)\s*(?P<amount>\d+)\s*(?P<unit>[a-zA-Z]+)\s*\)$")
            .expect("$NOW offset pattern is valid")
    })
}

/// Resolves dynamic variables against one caller at one instant.
#[derive(Debug, Clone)]
pub struct VariableResolver<'a> {
    accountability: &'a Accountability,
    now: DateTime<Utc>,
}

impl<'a> VariableResolver<'a> {
    pub fn new(accountability: &'a Accountability, now: DateTime<Utc>) -> Self {
        Self {
            accountability,
            now,
        }
    }

    pub fn accountability(&self) -> &Accountability {
        self.accountability
    }

    /// Convert a raw filter value, resolving variables (element-wise in arrays).
    pub fn resolve(&self, raw: &JsonValue) -> Result<Value> {
        match raw {
            JsonValue::String(s) if s.starts_with('$') => self.resolve_variable(s),
            JsonValue::Array(items) => items
                .iter()
                .map(|item| self.resolve(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::List),
            other => Ok(Value::from_json(other)),
        }
    }

    fn resolve_variable(&self, raw: &str) -> Result<Value> {
        if raw == "$NOW" {
            return Ok(Value::Timestamp(self.now));
        }
        if raw.starts_with("$NOW(") {
            return self.resolve_now_offset(raw).map(Value::Timestamp);
        }
        if raw == "$CURRENT_ROLES" {
            return Ok(Value::List(
                self.accountability
                    .roles
                    .iter()
                    .map(|r| Value::String(r.clone()))
                    .collect(),
            ));
        }
        if let Some(rest) = strip_variable(raw, "$CURRENT_USER") {
            return Ok(match rest {
                None => optional_string(self.accountability.user.as_deref()),
                Some(path) => lookup(&self.accountability.user_attributes, path),
            });
        }
        if let Some(rest) = strip_variable(raw, "$CURRENT_ROLE") {
            return Ok(match rest {
                None => optional_string(self.accountability.role()),
                Some(path) => lookup(&self.accountability.role_attributes, path),
            });
        }
        // Not a known variable: keep the literal.
        Ok(Value::String(raw.to_string()))
    }

    fn resolve_now_offset(&self, raw: &str) -> Result<DateTime<Utc>> {
        let invalid = || QueryError::invalid(format!("malformed date offset \"{raw}\""));
        let caps = now_offset().captures(raw).ok_or_else(invalid)?;
        let amount: i64 = caps["amount"].parse().map_err(|_| invalid())?;
        let negative = &caps["sign"] == "-";
        let unit = caps["unit"].to_ascii_lowercase();
        let unit = unit.strip_suffix('s').unwrap_or(&unit);

        let shifted = match unit {
            "month" | "year" => {
                let months = if unit == "year" {
                    amount.checked_mul(12).ok_or_else(invalid)?
                } else {
                    amount
                };
                let months = Months::new(u32::try_from(months).map_err(|_| invalid())?);
                if negative {
                    self.now.checked_sub_months(months)
                } else {
                    self.now.checked_add_months(months)
                }
            }
            _ => {
                let delta = match unit {
                    "second" => Duration::try_seconds(amount),
                    "minute" => Duration::try_minutes(amount),
                    "hour" => Duration::try_hours(amount),
                    "day" => Duration::try_days(amount),
                    "week" => Duration::try_weeks(amount),
                    _ => None,
                }
                .ok_or_else(invalid)?;
                if negative {
                    self.now.checked_sub_signed(delta)
                } else {
                    self.now.checked_add_signed(delta)
                }
            }
        };
        shifted.ok_or_else(invalid)
    }
}

/// `Some(None)` for the bare variable, `Some(Some(path))` for `$VAR.path`.
fn strip_variable<'s>(raw: &'s str, name: &str) -> Option<Option<&'s str>> {
    let rest = raw.strip_prefix(name)?;
    if rest.is_empty() {
        Some(None)
    } else {
        rest.strip_prefix('.').map(Some)
    }
}

fn optional_string(value: Option<&str>) -> Value {
    value
        .map(|v| Value::String(v.to_string()))
        .unwrap_or(Value::Null)
}

fn lookup(attributes: &Map<String, JsonValue>, path: &str) -> Value {
    let mut segments = path.split('.');
    let Some(first) = segments.next() else {
        return Value::Null;
    };
    let mut current = attributes.get(first);
    for segment in segments {
        current = current.and_then(|v| v.get(segment));
    }
    current.map(Value::from_json).unwrap_or(Value::Null)
}
