// SPDX-License-Identifier: PMPL-1.0-or-later
//! Query normalizer.
//!
//! Converts a [`RawQuery`] into a typed [`Query`]: list parameters are split,
//! JSON-encoded parameters decoded, pagination coerced and bounded, and the
//! `filter` (plus every `deep._filter`) parsed with the caller's
//! accountability so the result carries a fully resolved AST.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use crate::accountability::Accountability;
use crate::config::CompilerConfig;
use crate::error::{QueryError, Result};
use crate::filter::variables::VariableResolver;
use crate::filter::{FilterNode, FilterParser};
use crate::path::FieldPath;
use crate::query::{Aggregate, AggregateFunction, DeepQuery, MetaRequest, Query, RawQuery, SortSpec};

/// Normalizes raw parameters for one caller.
#[derive(Debug, Clone)]
pub struct Normalizer<'a> {
    config: &'a CompilerConfig,
    accountability: &'a Accountability,
    now: DateTime<Utc>,
}

impl<'a> Normalizer<'a> {
    pub fn new(config: &'a CompilerConfig, accountability: &'a Accountability) -> Self {
        Self {
            config,
            accountability,
            now: Utc::now(),
        }
    }

    /// Pin the instant `$NOW` resolves to.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    fn parser(&self) -> FilterParser<'a> {
        FilterParser::new(VariableResolver::new(self.accountability, self.now), self.config)
    }

    /// Parse a raw filter object with this caller's variables.
    pub fn parse_filter(&self, raw: &JsonValue) -> Result<Option<FilterNode>> {
        self.parser().parse(raw)
    }

    pub fn normalize(&self, raw: &RawQuery) -> Result<Query> {
        let mut query = Query {
            limit: self.config.query_limit_default,
            ..Query::default()
        };
        let mut offset = None;
        let mut page = None;

        for (key, value) in raw.iter() {
            match key.as_str() {
                "fields" => {
                    let fields = list_param(key, value)?
                        .iter()
                        .map(|f| FieldPath::parse(f))
                        .collect::<Result<Vec<_>>>()?;
                    if !fields.is_empty() {
                        query.fields = fields;
                    }
                }
                "filter" => query.filter = self.parse_filter(&json_param(key, value)?)?,
                "search" => query.search = search_param(key, value)?,
                "sort" => query.sort = sort_param(key, value)?,
                "limit" => query.limit = self.limit_param(key, value)?,
                "offset" => offset = Some(non_negative(key, int_param(key, value)?)?),
                "page" => page = Some(int_param(key, value)?),
                "meta" => query.meta = meta_param(value)?,
                "aggregate" => query.aggregate = aggregate_param(&json_param(key, value)?)?,
                "groupBy" => {
                    query.group_by = list_param(key, value)?
                        .iter()
                        .map(|f| FieldPath::parse(f))
                        .collect::<Result<Vec<_>>>()?;
                }
                "deep" => {
                    let deep = json_param(key, value)?;
                    query.deep = self.deep_map(key, &deep, 1)?;
                }
                "alias" => query.alias = alias_param(&json_param(key, value)?)?,
                other => debug!(parameter = other, "Ignoring unknown query parameter"),
            }
        }

        query.offset = resolve_offset(offset, page, query.limit)?;
        debug!(
            fields = query.fields.len(),
            has_filter = query.filter.is_some(),
            limit = query.limit,
            offset = query.offset,
            "Normalized query"
        );
        Ok(query)
    }

    fn limit_param(&self, key: &str, value: &JsonValue) -> Result<u64> {
        let limit = int_param(key, value)?;
        if limit <= 0 {
            return Err(QueryError::invalid(format!(
                "\"limit\" must be a positive integer, got {limit}"
            )));
        }
        let limit = limit as u64;
        if limit > self.config.query_limit_max {
            return Err(QueryError::invalid(format!(
                "\"limit\" {limit} exceeds the maximum of {}",
                self.config.query_limit_max
            )));
        }
        Ok(limit)
    }

    fn deep_map(&self, name: &str, raw: &JsonValue, level: usize) -> Result<BTreeMap<String, DeepQuery>> {
        let obj = raw
            .as_object()
            .ok_or_else(|| QueryError::invalid(format!("\"{name}\" must be an object")))?;
        let mut out = BTreeMap::new();
        for (relation, sub) in obj {
            if relation.starts_with('_') {
                return Err(QueryError::invalid(format!(
                    "\"{relation}\" must be nested under a relational field"
                )));
            }
            let sub = sub.as_object().ok_or_else(|| {
                QueryError::invalid(format!("deep entry \"{relation}\" must be an object"))
            })?;
            out.insert(relation.clone(), self.deep_query(relation, sub, level)?);
        }
        Ok(out)
    }

    fn deep_query(&self, relation: &str, raw: &Map<String, JsonValue>, level: usize) -> Result<DeepQuery> {
        if level > self.config.max_relational_depth {
            return Err(QueryError::QueryTooComplex {
                path: relation.to_string(),
                depth: level,
                max: self.config.max_relational_depth,
            });
        }

        let mut deep = DeepQuery::default();
        let mut offset = None;
        let mut page = None;
        let mut nested = Map::new();

        for (key, value) in raw {
            match key.as_str() {
                "_filter" => deep.filter = self.parse_filter(&json_param(key, value)?)?,
                "_sort" => deep.sort = sort_param(key, value)?,
                "_limit" => deep.limit = Some(self.limit_param(key, value)?),
                "_offset" => offset = Some(non_negative(key, int_param(key, value)?)?),
                "_page" => page = Some(int_param(key, value)?),
                "_search" => deep.search = search_param(key, value)?,
                other if other.starts_with('_') => {
                    debug!(relation, parameter = other, "Ignoring unknown deep parameter")
                }
                _ => {
                    nested.insert(key.clone(), value.clone());
                }
            }
        }

        if offset.is_some() || page.is_some() {
            let limit = deep.limit.unwrap_or(self.config.query_limit_default);
            deep.offset = Some(resolve_offset(offset, page, limit)?);
        }
        if !nested.is_empty() {
            deep.deep = self.deep_map(relation, &JsonValue::Object(nested), level + 1)?;
        }
        Ok(deep)
    }
}

/// Convenience wrapper around [`Normalizer::normalize`].
pub fn normalize_query(
    raw: &RawQuery,
    accountability: &Accountability,
    config: &CompilerConfig,
) -> Result<Query> {
    Normalizer::new(config, accountability).normalize(raw)
}

fn resolve_offset(offset: Option<u64>, page: Option<i64>, limit: u64) -> Result<u64> {
    match (offset, page) {
        (Some(_), Some(_)) => Err(QueryError::invalid(
            "\"page\" and \"offset\" cannot be combined",
        )),
        (Some(offset), None) => Ok(offset),
        (None, Some(page)) if page < 1 => Err(QueryError::invalid(format!(
            "\"page\" must be 1 or greater, got {page}"
        ))),
        (None, Some(page)) => (page as u64 - 1)
            .checked_mul(limit)
            .ok_or_else(|| QueryError::invalid("\"page\" is out of range")),
        (None, None) => Ok(0),
    }
}

/// Decode a parameter that may arrive JSON-encoded in a string.
fn json_param(name: &str, value: &JsonValue) -> Result<JsonValue> {
    match value {
        JsonValue::String(s) => serde_json::from_str(s)
            .map_err(|e| QueryError::invalid(format!("malformed JSON in \"{name}\": {e}"))),
        other => Ok(other.clone()),
    }
}

/// Comma lists, JSON arrays, or repeated parameters.
fn list_param(name: &str, value: &JsonValue) -> Result<Vec<String>> {
    match value {
        JsonValue::String(s) if s.trim_start().starts_with('[') => {
            list_param(name, &json_param(name, value)?)
        }
        JsonValue::String(s) => Ok(s
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()),
        JsonValue::Array(items) => {
            let mut out = Vec::new();
            for item in items {
                match item {
                    JsonValue::String(_) => out.extend(list_param(name, item)?),
                    _ => {
                        return Err(QueryError::invalid(format!(
                            "\"{name}\" entries must be strings"
                        )))
                    }
                }
            }
            Ok(out)
        }
        _ => Err(QueryError::invalid(format!(
            "\"{name}\" must be a comma-separated string or an array"
        ))),
    }
}

fn int_param(name: &str, value: &JsonValue) -> Result<i64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| QueryError::invalid(format!("\"{name}\" must be an integer")))
}

fn non_negative(name: &str, value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| QueryError::invalid(format!("\"{name}\" cannot be negative, got {value}")))
}

fn search_param(name: &str, value: &JsonValue) -> Result<Option<String>> {
    match value {
        JsonValue::String(s) if s.trim().is_empty() => Ok(None),
        JsonValue::String(s) => Ok(Some(s.trim().to_string())),
        JsonValue::Number(n) => Ok(Some(n.to_string())),
        JsonValue::Null => Ok(None),
        _ => Err(QueryError::invalid(format!("\"{name}\" must be a string"))),
    }
}

fn sort_param(name: &str, value: &JsonValue) -> Result<Vec<SortSpec>> {
    list_param(name, value)?.iter().map(|s| s.parse()).collect()
}

fn meta_param(value: &JsonValue) -> Result<MetaRequest> {
    let mut meta = MetaRequest::default();
    for entry in list_param("meta", value)? {
        match entry.as_str() {
            "total_count" => meta.total_count = true,
            "filter_count" => meta.filter_count = true,
            "*" => {
                meta.total_count = true;
                meta.filter_count = true;
            }
            other => {
                return Err(QueryError::invalid(format!("unknown meta field \"{other}\"")))
            }
        }
    }
    Ok(meta)
}

fn aggregate_param(raw: &JsonValue) -> Result<Vec<Aggregate>> {
    let obj = raw
        .as_object()
        .ok_or_else(|| QueryError::invalid("\"aggregate\" must be an object"))?;
    let mut out = Vec::new();
    for (name, fields) in obj {
        let function: AggregateFunction = name.parse()?;
        let fields = list_param("aggregate", fields)?;
        if fields.is_empty() {
            return Err(QueryError::invalid(format!("aggregate \"{name}\" needs a field")));
        }
        for field in fields {
            out.push(Aggregate::new(function, FieldPath::parse(&field)?));
        }
    }
    Ok(out)
}

fn alias_param(raw: &JsonValue) -> Result<BTreeMap<String, FieldPath>> {
    let obj = raw
        .as_object()
        .ok_or_else(|| QueryError::invalid("\"alias\" must be an object"))?;
    let mut out = BTreeMap::new();
    for (name, target) in obj {
        if name.is_empty() || name.contains('.') || name.contains('(') {
            return Err(QueryError::invalid(format!("invalid alias name \"{name}\"")));
        }
        let target = target
            .as_str()
            .ok_or_else(|| QueryError::invalid(format!("alias \"{name}\" must name a field")))?;
        out.insert(name.clone(), FieldPath::parse(target)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Operator;
    use serde_json::json;

    fn normalize(raw: RawQuery) -> Result<Query> {
        let acc = Accountability::new(Some("user-1"), &["reviewer"]);
        normalize_query(&raw, &acc, &CompilerConfig::default())
    }

    #[test]
    fn test_defaults() {
        let q = normalize(RawQuery::new()).unwrap();
        assert_eq!(q.limit, 100);
        assert_eq!(q.offset, 0);
        assert_eq!(q.fields, vec![FieldPath::parse("*").unwrap()]);
        assert!(q.filter.is_none());
    }

    #[test]
    fn test_list_parameters() {
        let q = normalize(RawQuery::from_pairs([
            ("fields", "id, title,ngo_id.name"),
            ("sort", "-date_created,title"),
            ("groupBy", r#"["status"]"#),
        ]))
        .unwrap();
        let fields: Vec<String> = q.fields.iter().map(|f| f.to_string()).collect();
        assert_eq!(fields, vec!["id", "title", "ngo_id.name"]);
        assert!(q.sort[0].descending);
        assert!(!q.sort[1].descending);
        assert_eq!(q.group_by[0].to_string(), "status");
    }

    #[test]
    fn test_filter_string_is_decoded_and_parsed() {
        let q = normalize(RawQuery::from_pairs([(
            "filter",
            r#"{"user_created": {"_eq": "$CURRENT_USER"}}"#,
        )]))
        .unwrap();
        let filter = q.filter.unwrap();
        let c = filter.comparisons()[0];
        assert_eq!(c.operator, Operator::Eq);
        assert_eq!(c.value, crate::value::Value::String("user-1".into()));
    }

    #[test]
    fn test_malformed_json_names_parameter() {
        let err = normalize(RawQuery::from_pairs([("filter", "{status:")])).unwrap_err();
        match err {
            QueryError::InvalidQuery(msg) => assert!(msg.contains("\"filter\"")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_limit_bounds() {
        assert!(normalize(RawQuery::from_pairs([("limit", "1000")])).is_ok());
        assert!(normalize(RawQuery::from_pairs([("limit", "1001")])).is_err());
        assert!(normalize(RawQuery::from_pairs([("limit", "0")])).is_err());
        assert!(normalize(RawQuery::from_pairs([("limit", "-1")])).is_err());
        assert!(normalize(RawQuery::from_pairs([("limit", "ten")])).is_err());
    }

    #[test]
    fn test_page_to_offset() {
        let q = normalize(RawQuery::from_pairs([("limit", "25"), ("page", "3")])).unwrap();
        assert_eq!(q.offset, 50);
        assert!(normalize(RawQuery::from_pairs([("page", "0")])).is_err());
        assert!(normalize(RawQuery::from_pairs([("page", "2"), ("offset", "5")])).is_err());
        assert!(normalize(RawQuery::from_pairs([("offset", "-5")])).is_err());
    }

    #[test]
    fn test_meta() {
        let q = normalize(RawQuery::from_pairs([("meta", "*")])).unwrap();
        assert!(q.meta.total_count && q.meta.filter_count);
        assert!(normalize(RawQuery::from_pairs([("meta", "rows")])).is_err());
    }

    #[test]
    fn test_aggregate() {
        let q = normalize(RawQuery::new().with("aggregate", json!({"count": "id", "avg": ["score"]})))
            .unwrap();
        let outputs: Vec<String> = q.aggregate.iter().map(Aggregate::output_path).collect();
        assert_eq!(outputs, vec!["avg.score", "count.id"]);

        let err = normalize(RawQuery::new().with("aggregate", json!({"median": "score"})));
        assert_eq!(err, Err(QueryError::UnknownOperator("median".into())));
    }

    #[test]
    fn test_deep() {
        let q = normalize(RawQuery::new().with(
            "deep",
            json!({"applications": {
                "_limit": 5,
                "_sort": "-submitted_at",
                "_filter": {"status": {"_eq": "submitted"}},
                "reviewers": {"_limit": 2}
            }}),
        ))
        .unwrap();
        let apps = &q.deep["applications"];
        assert_eq!(apps.limit, Some(5));
        assert!(apps.sort[0].descending);
        assert!(apps.filter.is_some());
        assert_eq!(apps.deep["reviewers"].limit, Some(2));
    }

    #[test]
    fn test_deep_page() {
        let q = normalize(RawQuery::new().with("deep", json!({"applications": {"_limit": 10, "_page": 2}})))
            .unwrap();
        assert_eq!(q.deep["applications"].offset, Some(10));
    }

    #[test]
    fn test_alias() {
        let q = normalize(RawQuery::new().with("alias", json!({"ngo_name": "ngo_id.name"}))).unwrap();
        assert_eq!(q.alias["ngo_name"].to_string(), "ngo_id.name");
        assert!(normalize(RawQuery::new().with("alias", json!({"a.b": "title"}))).is_err());
    }

    #[test]
    fn test_unknown_parameters_ignored() {
        assert!(normalize(RawQuery::from_pairs([("access_token", "secret")])).is_ok());
    }
}
