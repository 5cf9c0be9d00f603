// SPDX-License-Identifier: PMPL-1.0-or-later
//! In-memory filter evaluation.
//!
//! Checks a JSON record against a [`FilterNode`] without a store. Used for
//! permission `validation` rules on mutation payloads. Relational paths
//! descend into nested objects; an array on the way matches when any of its
//! elements does. Comparisons against a missing or null field are false
//! (except the null/empty checks), and `Not` negates the result plainly.

use std::cmp::Ordering;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde_json::{Map, Value as JsonValue};

use crate::filter::{Comparison, FilterNode, Operator};
use crate::path::FieldFunction;
use crate::value::Value;

static MISSING: JsonValue = JsonValue::Null;

impl FilterNode {
    /// Whether `record` satisfies the filter.
    pub fn matches(&self, record: &Map<String, JsonValue>) -> bool {
        match self {
            FilterNode::Comparison(c) => {
                let mut found = Vec::new();
                collect(record, c.path.segments(), &mut found);
                if found.is_empty() {
                    found.push(&MISSING);
                }
                found.into_iter().any(|raw| comparison_holds(c, raw))
            }
            FilterNode::And(children) => children.iter().all(|c| c.matches(record)),
            FilterNode::Or(children) => children.iter().any(|c| c.matches(record)),
            FilterNode::Not(inner) => !inner.matches(record),
            FilterNode::False => false,
        }
    }

    /// Like [`FilterNode::matches`], but comparisons on top-level fields
    /// absent from `record` count as satisfied. Partial updates leave those
    /// fields untouched.
    pub fn matches_present(&self, record: &Map<String, JsonValue>) -> bool {
        self.check_present(record).unwrap_or(true)
    }

    /// `None` when nothing in the node touches a field of `record`.
    fn check_present(&self, record: &Map<String, JsonValue>) -> Option<bool> {
        match self {
            FilterNode::Comparison(c) => {
                let head = c.path.segments().first()?;
                record.contains_key(head).then(|| self.matches(record))
            }
            FilterNode::And(children) => {
                let mut checked = None;
                for child in children {
                    match child.check_present(record) {
                        Some(false) => return Some(false),
                        Some(true) => checked = Some(true),
                        None => {}
                    }
                }
                checked
            }
            FilterNode::Or(children) => {
                let mut checked = Some(false);
                for child in children {
                    match child.check_present(record) {
                        Some(true) => return Some(true),
                        None => checked = None,
                        Some(false) => {}
                    }
                }
                checked
            }
            FilterNode::Not(inner) => inner.check_present(record).map(|matched| !matched),
            FilterNode::False => Some(false),
        }
    }
}

/// Gather every value reachable through `segments`, fanning out over arrays
/// on intermediate segments.
fn collect<'a>(record: &'a Map<String, JsonValue>, segments: &[String], out: &mut Vec<&'a JsonValue>) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    let Some(value) = record.get(head) else {
        return;
    };
    if rest.is_empty() {
        out.push(value);
        return;
    }
    match value {
        JsonValue::Object(inner) => collect(inner, rest, out),
        JsonValue::Array(items) => {
            for item in items {
                if let JsonValue::Object(inner) = item {
                    collect(inner, rest, out);
                }
            }
        }
        _ => {}
    }
}

fn comparison_holds(c: &Comparison, raw: &JsonValue) -> bool {
    let actual = match c.path.function() {
        Some(function) => apply_function(function, raw),
        None => Value::from_json(raw),
    };

    match c.operator {
        Operator::Null => actual.is_null() == c.value.as_flag().unwrap_or(true),
        Operator::NNull => actual.is_null() != c.value.as_flag().unwrap_or(true),
        Operator::Empty => is_empty(&actual) == c.value.as_flag().unwrap_or(true),
        Operator::NEmpty => is_empty(&actual) != c.value.as_flag().unwrap_or(true),
        _ if actual.is_null() => false,
        Operator::Eq => compare(&actual, &c.value) == Some(Ordering::Equal),
        Operator::Neq => compare(&actual, &c.value) != Some(Ordering::Equal),
        Operator::Gt => compare(&actual, &c.value) == Some(Ordering::Greater),
        Operator::Gte => matches!(
            compare(&actual, &c.value),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operator::Lt => compare(&actual, &c.value) == Some(Ordering::Less),
        Operator::Lte => matches!(
            compare(&actual, &c.value),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Operator::In => in_list(&actual, &c.value),
        Operator::Nin => !in_list(&actual, &c.value),
        Operator::Between => between(&actual, &c.value),
        Operator::NBetween => !between(&actual, &c.value),
        Operator::Contains => text_test(&actual, &c.value, false, |a, b| a.contains(b)),
        Operator::NContains => !text_test(&actual, &c.value, false, |a, b| a.contains(b)),
        Operator::IContains => text_test(&actual, &c.value, true, |a, b| a.contains(b)),
        Operator::StartsWith => text_test(&actual, &c.value, false, |a, b| a.starts_with(b)),
        Operator::NStartsWith => !text_test(&actual, &c.value, false, |a, b| a.starts_with(b)),
        Operator::EndsWith => text_test(&actual, &c.value, false, |a, b| a.ends_with(b)),
        Operator::NEndsWith => !text_test(&actual, &c.value, false, |a, b| a.ends_with(b)),
    }
}

fn apply_function(function: FieldFunction, raw: &JsonValue) -> Value {
    if function == FieldFunction::Count {
        return match raw {
            JsonValue::Array(items) => Value::Int(items.len() as i64),
            JsonValue::String(s) if s.is_empty() => Value::Int(0),
            JsonValue::String(s) => Value::Int(s.split(',').count() as i64),
            _ => Value::Null,
        };
    }
    let Some(ts) = raw.as_str().and_then(parse_timestamp) else {
        return Value::Null;
    };
    let part = match function {
        FieldFunction::Year => ts.year() as i64,
        FieldFunction::Month => ts.month() as i64,
        FieldFunction::Week => ts.iso_week().week() as i64,
        FieldFunction::Day => ts.day() as i64,
        FieldFunction::Weekday => ts.weekday().num_days_from_sunday() as i64,
        FieldFunction::Hour => ts.hour() as i64,
        FieldFunction::Minute => ts.minute() as i64,
        FieldFunction::Second => ts.second() as i64,
        FieldFunction::Count => return Value::Null,
    };
    Value::Int(part)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::List(items) => items.is_empty(),
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn compare(actual: &Value, expected: &Value) -> Option<Ordering> {
    match (actual, expected) {
        (Value::Bool(a), b) => b.as_flag().map(|b| a.cmp(&b)),
        (Value::Int(_) | Value::Float(_), _) | (_, Value::Int(_) | Value::Float(_)) => {
            as_number(actual)?.partial_cmp(&as_number(expected)?)
        }
        (Value::String(a), Value::Timestamp(b)) => parse_timestamp(a).map(|a| a.cmp(b)),
        (Value::Timestamp(a), Value::String(b)) => parse_timestamp(b).map(|b| a.cmp(&b)),
        (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        (Value::Json(a), Value::Json(b)) => (a == b).then_some(Ordering::Equal),
        _ => None,
    }
}

fn in_list(actual: &Value, list: &Value) -> bool {
    match list {
        Value::List(items) => items
            .iter()
            .any(|item| compare(actual, item) == Some(Ordering::Equal)),
        single => compare(actual, single) == Some(Ordering::Equal),
    }
}

fn between(actual: &Value, range: &Value) -> bool {
    let Value::List(bounds) = range else {
        return false;
    };
    let [low, high] = bounds.as_slice() else {
        return false;
    };
    matches!(compare(actual, low), Some(Ordering::Greater | Ordering::Equal))
        && matches!(compare(actual, high), Some(Ordering::Less | Ordering::Equal))
}

fn text_test(actual: &Value, needle: &Value, fold_case: bool, test: fn(&str, &str) -> bool) -> bool {
    let haystack = match actual {
        Value::String(s) => s.clone(),
        Value::List(_) | Value::Json(_) | Value::Null => return false,
        other => other.to_string(),
    };
    let needle = match needle {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if fold_case {
        test(&haystack.to_lowercase(), &needle.to_lowercase())
    } else {
        test(&haystack, &needle)
    }
}
