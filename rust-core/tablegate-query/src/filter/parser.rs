// SPDX-License-Identifier: PMPL-1.0-or-later
//! Filter expression parser.
//!
//! Turns the raw JSON `filter` object into a [`FilterNode`] tree:
//!
//! ```json
//! { "_or": [ { "status": { "_eq": "active" } },
//!            { "ngo_id": { "organization_id": { "_eq": "$CURRENT_USER.organization_id" } } } ] }
//! ```
//!
//! Nested field objects extend the current dot-path, `_and` / `_or` / `_not`
//! build logical nodes relative to that path, and `_`-prefixed keys below a
//! path are comparison operators. Logical nesting and relational depth are
//! tracked explicitly and bounded.

use serde_json::{Map, Value as JsonValue};
use tracing::trace;

use crate::config::CompilerConfig;
use crate::error::{QueryError, Result};
use crate::filter::variables::VariableResolver;
use crate::filter::{Comparison, FilterNode, Operator};
use crate::path::{FieldFunction, FieldPath};
use crate::value::Value;

/// Path accumulated while descending into nested field objects.
#[derive(Debug, Clone, Default)]
struct Scope {
    segments: Vec<String>,
    function: Option<FieldFunction>,
}

impl Scope {
    fn display(&self) -> String {
        if self.segments.is_empty() {
            "filter".to_string()
        } else {
            self.path().to_string()
        }
    }

    fn path(&self) -> FieldPath {
        FieldPath::from_segments(self.segments.iter().cloned()).with_function(self.function)
    }
}

/// Parser for one request's filter expressions.
#[derive(Debug, Clone)]
pub struct FilterParser<'a> {
    resolver: VariableResolver<'a>,
    max_depth: usize,
    max_nesting: usize,
}

impl<'a> FilterParser<'a> {
    pub fn new(resolver: VariableResolver<'a>, config: &CompilerConfig) -> Self {
        Self {
            resolver,
            max_depth: config.max_relational_depth,
            max_nesting: config.filter_max_nesting,
        }
    }

    /// Lift the relational depth limit, for filters from permission rules.
    pub fn trusted(mut self) -> Self {
        self.max_depth = usize::MAX;
        self
    }

    /// Parse a raw filter. An empty object yields `None`.
    pub fn parse(&self, raw: &JsonValue) -> Result<Option<FilterNode>> {
        let obj = raw
            .as_object()
            .ok_or_else(|| QueryError::invalid("filter must be a JSON object"))?;
        let nodes = self.parse_object(obj, &Scope::default(), 0)?;
        let node = combine(nodes);
        trace!(?node, "Parsed filter");
        Ok(node)
    }

    fn parse_object(
        &self,
        obj: &Map<String, JsonValue>,
        scope: &Scope,
        nesting: usize,
    ) -> Result<Vec<FilterNode>> {
        if nesting > self.max_nesting {
            return Err(QueryError::QueryTooComplex {
                path: scope.display(),
                depth: nesting,
                max: self.max_nesting,
            });
        }

        let mut nodes = Vec::with_capacity(obj.len());
        for (key, value) in obj {
            match key.as_str() {
                "_and" | "_or" => {
                    let items = value.as_array().ok_or_else(|| {
                        QueryError::invalid(format!("{key} in {} expects an array", scope.display()))
                    })?;
                    let mut children = Vec::with_capacity(items.len());
                    for item in items {
                        let item = item.as_object().ok_or_else(|| {
                            QueryError::invalid(format!("{key} entries must be objects"))
                        })?;
                        children.extend(combine(self.parse_object(item, scope, nesting + 1)?));
                    }
                    if children.is_empty() {
                        continue;
                    }
                    nodes.push(if key == "_and" {
                        FilterNode::And(children)
                    } else {
                        FilterNode::Or(children)
                    });
                }
                "_not" => {
                    let inner = value.as_object().ok_or_else(|| {
                        QueryError::invalid(format!("_not in {} expects an object", scope.display()))
                    })?;
                    if let Some(inner) = combine(self.parse_object(inner, scope, nesting + 1)?) {
                        nodes.push(FilterNode::Not(Box::new(inner)));
                    }
                }
                op if op.starts_with('_') => {
                    if scope.segments.is_empty() {
                        return Err(QueryError::invalid(format!(
                            "operator {op} must be nested under a field"
                        )));
                    }
                    let operator: Operator = op.parse()?;
                    let value = self.parse_value(operator, value, scope)?;
                    nodes.push(FilterNode::Comparison(Comparison::new(
                        scope.path(),
                        operator,
                        value,
                    )));
                }
                field => {
                    let child = self.descend(scope, field)?;
                    let inner = value.as_object().ok_or_else(|| {
                        QueryError::invalid(format!(
                            "expected an operator object for \"{}\"",
                            child.display()
                        ))
                    })?;
                    let children = self.parse_object(inner, &child, nesting)?;
                    if children.is_empty() {
                        return Err(QueryError::invalid(format!(
                            "empty condition for \"{}\"",
                            child.display()
                        )));
                    }
                    nodes.extend(children);
                }
            }
        }
        Ok(nodes)
    }

    /// Extend the scope by a (possibly dotted, possibly function-wrapped) key.
    fn descend(&self, scope: &Scope, key: &str) -> Result<Scope> {
        if scope.function.is_some() {
            return Err(QueryError::invalid(format!(
                "function in \"{}\" must wrap the last path segment",
                scope.display()
            )));
        }
        let parsed = FieldPath::parse(key)?;
        let mut segments = scope.segments.clone();
        segments.extend(parsed.segments().iter().cloned());

        let child = Scope {
            segments,
            function: parsed.function(),
        };
        let depth = child.segments.len().saturating_sub(1);
        if depth > self.max_depth {
            return Err(QueryError::QueryTooComplex {
                path: child.display(),
                depth,
                max: self.max_depth,
            });
        }
        Ok(child)
    }

    fn parse_value(&self, operator: Operator, raw: &JsonValue, scope: &Scope) -> Result<Value> {
        let shape_error = |expected: &str| {
            QueryError::invalid(format!(
                "{operator} on \"{}\" expects {expected}",
                scope.display()
            ))
        };

        if operator.is_flag() {
            return self
                .resolver
                .resolve(raw)?
                .as_flag()
                .map(Value::Bool)
                .ok_or_else(|| shape_error("a boolean"));
        }

        if operator.expects_list() {
            let list = match raw {
                JsonValue::String(s) if !s.starts_with('$') => s
                    .split(',')
                    .map(|item| Value::String(item.trim().to_string()))
                    .collect(),
                other => match self.resolver.resolve(other)? {
                    Value::List(items) => items,
                    single => vec![single],
                },
            };
            let is_range = matches!(operator, Operator::Between | Operator::NBetween);
            if is_range && list.len() != 2 {
                return Err(shape_error("exactly two values"));
            }
            if list.is_empty() {
                return Err(shape_error("at least one value"));
            }
            return Ok(Value::List(list));
        }

        let value = self.resolver.resolve(raw)?;
        match value {
            Value::List(_) => Err(shape_error("a single value")),
            Value::Null if operator.is_pattern() || operator.is_ordering() => {
                Err(shape_error("a non-null value"))
            }
            value => Ok(value),
        }
    }
}

fn combine(mut nodes: Vec<FilterNode>) -> Option<FilterNode> {
    match nodes.len() {
        0 => None,
        1 => nodes.pop(),
        _ => Some(FilterNode::And(nodes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accountability::Accountability;
    use chrono::Utc;
    use serde_json::json;

    fn parse_with(raw: JsonValue, config: &CompilerConfig) -> Result<Option<FilterNode>> {
        let acc = Accountability::new(Some("user-1"), &["reviewer"]).with_user_attributes(
            json!({"organization_id": "org-9"}).as_object().unwrap().clone(),
        );
        let parser = FilterParser::new(VariableResolver::new(&acc, Utc::now()), config);
        parser.parse(&raw)
    }

    fn parse(raw: JsonValue) -> Result<Option<FilterNode>> {
        parse_with(raw, &CompilerConfig::default())
    }

    fn leaf(node: &FilterNode) -> &Comparison {
        match node {
            FilterNode::Comparison(c) => c,
            other => panic!("expected comparison, got {other:?}"),
        }
    }

    #[test]
    fn test_simple_comparison() {
        let node = parse(json!({"status": {"_eq": "active"}})).unwrap().unwrap();
        let c = leaf(&node);
        assert_eq!(c.path.to_string(), "status");
        assert_eq!(c.operator, Operator::Eq);
        assert_eq!(c.value, Value::String("active".into()));
    }

    #[test]
    fn test_nested_relational_path() {
        let node = parse(json!({"ngo_id": {"organization_id": {"_eq": "org-123"}}}))
            .unwrap()
            .unwrap();
        assert_eq!(leaf(&node).path.segments(), ["ngo_id", "organization_id"]);
    }

    #[test]
    fn test_logical_operators() {
        let node = parse(json!({
            "_or": [
                {"status": {"_eq": "draft"}},
                {"_not": {"score": {"_lt": 3}}}
            ]
        }))
        .unwrap()
        .unwrap();
        match node {
            FilterNode::Or(children) => {
                assert_eq!(children.len(), 2);
                assert!(matches!(children[1], FilterNode::Not(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_logical_operator_under_field_keeps_path() {
        let node = parse(json!({"ngo_id": {"_or": [
            {"name": {"_eq": "a"}},
            {"status": {"_eq": "b"}}
        ]}}))
        .unwrap()
        .unwrap();
        let paths: Vec<String> = node.comparisons().iter().map(|c| c.path.to_string()).collect();
        assert_eq!(paths, vec!["ngo_id.name", "ngo_id.status"]);
    }

    #[test]
    fn test_multiple_keys_are_anded() {
        let node = parse(json!({"a": {"_eq": 1}, "b": {"_eq": 2}})).unwrap().unwrap();
        assert!(matches!(node, FilterNode::And(ref c) if c.len() == 2));
    }

    #[test]
    fn test_function_key_split() {
        let node = parse(json!({"year(date_created)": {"_eq": 2024}})).unwrap().unwrap();
        let c = leaf(&node);
        assert_eq!(c.path.segments(), ["date_created"]);
        assert_eq!(c.path.function(), Some(FieldFunction::Year));
    }

    #[test]
    fn test_trailing_function_in_nested_key() {
        let node = parse(json!({"a": {"b.count(c.d)": {"_gt": 1}}})).unwrap().unwrap();
        let c = leaf(&node);
        assert_eq!(c.path.segments(), ["a", "b", "c", "d"]);
        assert_eq!(c.path.function(), Some(FieldFunction::Count));
    }

    #[test]
    fn test_function_must_be_last() {
        let result = parse(json!({"count(a)": {"b": {"_eq": 1}}}));
        assert!(matches!(result, Err(QueryError::InvalidQuery(_))));
    }

    #[test]
    fn test_dynamic_variables_resolved_at_parse_time() {
        let node = parse(json!({"organization_id": {"_eq": "$CURRENT_USER.organization_id"}}))
            .unwrap()
            .unwrap();
        assert_eq!(leaf(&node).value, Value::String("org-9".into()));
    }

    #[test]
    fn test_unknown_operator() {
        assert_eq!(
            parse(json!({"status": {"_like": "x"}})),
            Err(QueryError::UnknownOperator("_like".into()))
        );
    }

    #[test]
    fn test_in_accepts_csv_string() {
        let node = parse(json!({"status": {"_in": "draft, published"}})).unwrap().unwrap();
        assert_eq!(
            leaf(&node).value,
            Value::List(vec![
                Value::String("draft".into()),
                Value::String("published".into())
            ])
        );
    }

    #[test]
    fn test_between_requires_two_values() {
        assert!(parse(json!({"score": {"_between": [1]}})).is_err());
        assert!(parse(json!({"score": {"_between": [1, 5]}})).is_ok());
    }

    #[test]
    fn test_null_flag() {
        let node = parse(json!({"ngo_id": {"_null": "true"}})).unwrap().unwrap();
        assert_eq!(leaf(&node).value, Value::Bool(true));
        assert!(parse(json!({"ngo_id": {"_null": "maybe"}})).is_err());
    }

    #[test]
    fn test_empty_filter_is_none() {
        assert_eq!(parse(json!({})).unwrap(), None);
        assert_eq!(parse(json!({"_and": []})).unwrap(), None);
    }

    #[test]
    fn test_bare_operator_rejected() {
        assert!(parse(json!({"_eq": 1})).is_err());
        assert!(parse(json!({"status": "active"})).is_err());
        assert!(parse(json!(["status"])).is_err());
    }

    #[test]
    fn test_relational_depth_fails_fast() {
        let config = CompilerConfig {
            max_relational_depth: 2,
            ..CompilerConfig::default()
        };
        assert!(parse_with(json!({"a": {"b": {"c": {"_eq": 1}}}}), &config).is_ok());
        let result = parse_with(json!({"a": {"b": {"c": {"d": {"_eq": 1}}}}}), &config);
        assert!(matches!(result, Err(QueryError::QueryTooComplex { depth: 3, max: 2, .. })));
    }

    #[test]
    fn test_logical_nesting_bounded() {
        let config = CompilerConfig {
            filter_max_nesting: 3,
            ..CompilerConfig::default()
        };
        let mut raw = json!({"a": {"_eq": 1}});
        for _ in 0..5 {
            raw = json!({"_and": [raw]});
        }
        let result = parse_with(raw, &config);
        assert!(matches!(result, Err(QueryError::QueryTooComplex { .. })));
    }
}
