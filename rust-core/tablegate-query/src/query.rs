// SPDX-License-Identifier: PMPL-1.0-or-later
//! Query descriptions: the raw parameter bag and its normalized form.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{QueryError, Result};
use crate::filter::FilterNode;
use crate::path::FieldPath;

/// Untrusted query parameters exactly as the transport delivered them.
///
/// Values are kept as JSON: query-string pairs become strings (repeated keys
/// collect into arrays), JSON bodies keep their structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawQuery {
    params: BTreeMap<String, JsonValue>,
}

impl RawQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from decoded query-string pairs.
    ///
    /// `key[]` is treated as `key`; `key[sub]` collects into an object under
    /// `key` (e.g. `aggregate[count]=id`).
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut raw = Self::new();
        for (key, value) in pairs {
            let key = key.as_ref().trim_end_matches("[]");
            let value = JsonValue::String(value.into());
            match key.split_once('[') {
                Some((name, rest)) if rest.ends_with(']') => {
                    let sub = rest.trim_end_matches(']').to_string();
                    let entry = raw
                        .params
                        .entry(name.to_string())
                        .or_insert_with(|| JsonValue::Object(Map::new()));
                    if let JsonValue::Object(map) = entry {
                        append(map.entry(sub).or_insert(JsonValue::Null), value);
                    }
                }
                _ => raw.insert(key, value),
            }
        }
        raw
    }

    /// Build from a JSON object (e.g. a SEARCH request body).
    pub fn from_json(json: &JsonValue) -> Result<Self> {
        let obj = json
            .as_object()
            .ok_or_else(|| QueryError::invalid("query must be a JSON object"))?;
        Ok(Self {
            params: obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        })
    }

    /// Add a value; a repeated key turns the entry into an array.
    pub fn insert(&mut self, key: &str, value: JsonValue) {
        append(
            self.params.entry(key.to_string()).or_insert(JsonValue::Null),
            value,
        );
    }

    /// Builder-style [`RawQuery::insert`].
    pub fn with(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.insert(key, value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.params.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.params.iter()
    }
}

fn append(slot: &mut JsonValue, value: JsonValue) {
    match slot {
        JsonValue::Null => *slot = value,
        JsonValue::Array(items) => items.push(value),
        existing => {
            let first = existing.take();
            *existing = JsonValue::Array(vec![first, value]);
        }
    }
}

/// One ORDER BY entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub path: FieldPath,
    pub descending: bool,
}

impl SortSpec {
    pub fn asc(path: FieldPath) -> Self {
        Self {
            path,
            descending: false,
        }
    }

    pub fn desc(path: FieldPath) -> Self {
        Self {
            path,
            descending: true,
        }
    }
}

impl FromStr for SortSpec {
    type Err = QueryError;

    /// `title` sorts ascending, `-title` descending.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.strip_prefix('-') {
            Some(rest) => Ok(Self::desc(FieldPath::parse(rest)?)),
            None => Ok(Self::asc(FieldPath::parse(s)?)),
        }
    }
}

impl fmt::Display for SortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.descending {
            write!(f, "-")?;
        }
        write!(f, "{}", self.path)
    }
}

/// Aggregate functions accepted under `aggregate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AggregateFunction {
    Count,
    CountDistinct,
    CountAll,
    Sum,
    SumDistinct,
    Avg,
    AvgDistinct,
    Min,
    Max,
}

impl AggregateFunction {
    pub const ALL: [AggregateFunction; 9] = [
        AggregateFunction::Count,
        AggregateFunction::CountDistinct,
        AggregateFunction::CountAll,
        AggregateFunction::Sum,
        AggregateFunction::SumDistinct,
        AggregateFunction::Avg,
        AggregateFunction::AvgDistinct,
        AggregateFunction::Min,
        AggregateFunction::Max,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::CountDistinct => "countDistinct",
            AggregateFunction::CountAll => "countAll",
            AggregateFunction::Sum => "sum",
            AggregateFunction::SumDistinct => "sumDistinct",
            AggregateFunction::Avg => "avg",
            AggregateFunction::AvgDistinct => "avgDistinct",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }

    /// `sum` and `avg` variants only make sense on numbers.
    pub fn requires_numeric(self) -> bool {
        matches!(
            self,
            AggregateFunction::Sum
                | AggregateFunction::SumDistinct
                | AggregateFunction::Avg
                | AggregateFunction::AvgDistinct
        )
    }

    /// Counting functions accept `*`.
    pub fn accepts_wildcard(self) -> bool {
        matches!(
            self,
            AggregateFunction::Count | AggregateFunction::CountDistinct | AggregateFunction::CountAll
        )
    }

    pub fn is_distinct(self) -> bool {
        matches!(
            self,
            AggregateFunction::CountDistinct
                | AggregateFunction::SumDistinct
                | AggregateFunction::AvgDistinct
        )
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AggregateFunction {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        AggregateFunction::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| QueryError::UnknownOperator(s.to_string()))
    }
}

/// One aggregate projection, e.g. `count(id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    pub function: AggregateFunction,
    pub field: FieldPath,
}

impl Aggregate {
    pub fn new(function: AggregateFunction, field: FieldPath) -> Self {
        Self { function, field }
    }

    /// Result column name, `<fn>.<field>`.
    pub fn output_path(&self) -> String {
        format!("{}.{}", self.function, self.field)
    }
}

/// Which counts to compute alongside the rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRequest {
    pub total_count: bool,
    pub filter_count: bool,
}

impl MetaRequest {
    pub fn is_empty(&self) -> bool {
        !self.total_count && !self.filter_count
    }
}

/// Sub-query parameters for a relational field (`deep`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeepQuery {
    pub filter: Option<FilterNode>,
    pub sort: Vec<SortSpec>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub search: Option<String>,
    /// Nested relation names below this one.
    pub deep: BTreeMap<String, DeepQuery>,
}

/// Typed, validated-shape query. Immutable after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub fields: Vec<FieldPath>,
    pub filter: Option<FilterNode>,
    pub search: Option<String>,
    pub sort: Vec<SortSpec>,
    pub limit: u64,
    pub offset: u64,
    pub aggregate: Vec<Aggregate>,
    pub group_by: Vec<FieldPath>,
    pub deep: BTreeMap<String, DeepQuery>,
    /// Output name → source path.
    pub alias: BTreeMap<String, FieldPath>,
    pub meta: MetaRequest,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            fields: vec![FieldPath::from_segments(["*"])],
            filter: None,
            search: None,
            sort: Vec::new(),
            limit: crate::config::QUERY_LIMIT_DEFAULT,
            offset: 0,
            aggregate: Vec::new(),
            group_by: Vec::new(),
            deep: BTreeMap::new(),
            alias: BTreeMap::new(),
            meta: MetaRequest::default(),
        }
    }
}

impl Query {
    pub fn is_aggregating(&self) -> bool {
        !self.aggregate.is_empty()
    }
}
