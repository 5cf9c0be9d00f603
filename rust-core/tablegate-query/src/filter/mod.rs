// SPDX-License-Identifier: PMPL-1.0-or-later
//! Filter AST.
//!
//! [`FilterNode`] is built once by the [`parser`] and then consumed read-only
//! by validation, permission merging and compilation. Every later stage
//! matches on it exhaustively.

pub mod eval;
pub mod parser;
pub mod variables;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, Result};
use crate::path::FieldPath;
use crate::value::Value;

pub use parser::FilterParser;

/// Comparison operators accepted in filter expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "_eq")]
    Eq,
    #[serde(rename = "_neq")]
    Neq,
    #[serde(rename = "_gt")]
    Gt,
    #[serde(rename = "_gte")]
    Gte,
    #[serde(rename = "_lt")]
    Lt,
    #[serde(rename = "_lte")]
    Lte,
    #[serde(rename = "_in")]
    In,
    #[serde(rename = "_nin")]
    Nin,
    #[serde(rename = "_between")]
    Between,
    #[serde(rename = "_nbetween")]
    NBetween,
    #[serde(rename = "_contains")]
    Contains,
    #[serde(rename = "_ncontains")]
    NContains,
    #[serde(rename = "_icontains")]
    IContains,
    #[serde(rename = "_starts_with")]
    StartsWith,
    #[serde(rename = "_nstarts_with")]
    NStartsWith,
    #[serde(rename = "_ends_with")]
    EndsWith,
    #[serde(rename = "_nends_with")]
    NEndsWith,
    #[serde(rename = "_null")]
    Null,
    #[serde(rename = "_nnull")]
    NNull,
    #[serde(rename = "_empty")]
    Empty,
    #[serde(rename = "_nempty")]
    NEmpty,
}

impl Operator {
    pub const ALL: [Operator; 21] = [
        Operator::Eq,
        Operator::Neq,
        Operator::Gt,
        Operator::Gte,
        Operator::Lt,
        Operator::Lte,
        Operator::In,
        Operator::Nin,
        Operator::Between,
        Operator::NBetween,
        Operator::Contains,
        Operator::NContains,
        Operator::IContains,
        Operator::StartsWith,
        Operator::NStartsWith,
        Operator::EndsWith,
        Operator::NEndsWith,
        Operator::Null,
        Operator::NNull,
        Operator::Empty,
        Operator::NEmpty,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "_eq",
            Operator::Neq => "_neq",
            Operator::Gt => "_gt",
            Operator::Gte => "_gte",
            Operator::Lt => "_lt",
            Operator::Lte => "_lte",
            Operator::In => "_in",
            Operator::Nin => "_nin",
            Operator::Between => "_between",
            Operator::NBetween => "_nbetween",
            Operator::Contains => "_contains",
            Operator::NContains => "_ncontains",
            Operator::IContains => "_icontains",
            Operator::StartsWith => "_starts_with",
            Operator::NStartsWith => "_nstarts_with",
            Operator::EndsWith => "_ends_with",
            Operator::NEndsWith => "_nends_with",
            Operator::Null => "_null",
            Operator::NNull => "_nnull",
            Operator::Empty => "_empty",
            Operator::NEmpty => "_nempty",
        }
    }

    /// Pattern-match operators (compiled to `LIKE`).
    pub fn is_pattern(self) -> bool {
        matches!(
            self,
            Operator::Contains
                | Operator::NContains
                | Operator::IContains
                | Operator::StartsWith
                | Operator::NStartsWith
                | Operator::EndsWith
                | Operator::NEndsWith
        )
    }

    /// Operators that need an ordered domain.
    pub fn is_ordering(self) -> bool {
        matches!(
            self,
            Operator::Gt
                | Operator::Gte
                | Operator::Lt
                | Operator::Lte
                | Operator::Between
                | Operator::NBetween
        )
    }

    /// Operators whose value is a boolean flag rather than a comparand.
    pub fn is_flag(self) -> bool {
        matches!(
            self,
            Operator::Null | Operator::NNull | Operator::Empty | Operator::NEmpty
        )
    }

    /// Operators whose value is a list.
    pub fn expects_list(self) -> bool {
        matches!(
            self,
            Operator::In | Operator::Nin | Operator::Between | Operator::NBetween
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Operator {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        Operator::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| QueryError::UnknownOperator(s.to_string()))
    }
}

/// A leaf test: `path <operator> value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub path: FieldPath,
    pub operator: Operator,
    pub value: Value,
}

impl Comparison {
    pub fn new(path: FieldPath, operator: Operator, value: Value) -> Self {
        Self {
            path,
            operator,
            value,
        }
    }
}

/// Boolean filter expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterNode {
    Comparison(Comparison),
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Not(Box<FilterNode>),
    /// Unsatisfiable predicate (`1 = 0`).
    False,
}

/// How [`merge_filters`] combines two filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    And,
    Or,
}

/// Combine two optional filters.
///
/// An absent side yields the other side unchanged; two absent sides yield
/// `None`. Otherwise both are wrapped in a new `And`/`Or` node.
pub fn merge_filters(
    a: Option<FilterNode>,
    b: Option<FilterNode>,
    strategy: MergeStrategy,
) -> Option<FilterNode> {
    match (a, b) {
        (None, None) => None,
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (Some(a), Some(b)) => Some(match strategy {
            MergeStrategy::And => FilterNode::And(vec![a, b]),
            MergeStrategy::Or => FilterNode::Or(vec![a, b]),
        }),
    }
}

impl FilterNode {
    /// Shorthand for a comparison leaf.
    pub fn compare(path: &str, operator: Operator, value: Value) -> Result<Self> {
        Ok(FilterNode::Comparison(Comparison::new(
            FieldPath::parse(path)?,
            operator,
            value,
        )))
    }

    /// All comparisons in the tree, depth-first.
    pub fn comparisons(&self) -> Vec<&Comparison> {
        let mut out = Vec::new();
        self.collect_comparisons(&mut out);
        out
    }

    fn collect_comparisons<'a>(&'a self, out: &mut Vec<&'a Comparison>) {
        match self {
            FilterNode::Comparison(c) => out.push(c),
            FilterNode::And(children) | FilterNode::Or(children) => {
                for child in children {
                    child.collect_comparisons(out);
                }
            }
            FilterNode::Not(inner) => inner.collect_comparisons(out),
            FilterNode::False => {}
        }
    }

    /// Stable textual key used to order filters independently of input order.
    pub fn canonical_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Copy of the tree with every comparison path prefixed by `prefix`.
    pub fn prefixed(&self, prefix: &[String]) -> FilterNode {
        match self {
            FilterNode::Comparison(c) => FilterNode::Comparison(Comparison {
                path: c.path.prefixed(prefix),
                operator: c.operator,
                value: c.value.clone(),
            }),
            FilterNode::And(children) => {
                FilterNode::And(children.iter().map(|c| c.prefixed(prefix)).collect())
            }
            FilterNode::Or(children) => {
                FilterNode::Or(children.iter().map(|c| c.prefixed(prefix)).collect())
            }
            FilterNode::Not(inner) => FilterNode::Not(Box::new(inner.prefixed(prefix))),
            FilterNode::False => FilterNode::False,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eq(path: &str, value: &str) -> FilterNode {
        FilterNode::compare(path, Operator::Eq, Value::String(value.into())).unwrap()
    }

    #[test]
    fn test_operator_roundtrip() {
        for op in Operator::ALL {
            assert_eq!(op.as_str().parse::<Operator>().unwrap(), op);
        }
    }

    #[test]
    fn test_unknown_operator() {
        assert_eq!(
            "_like".parse::<Operator>(),
            Err(QueryError::UnknownOperator("_like".into()))
        );
    }

    #[test]
    fn test_merge_identity() {
        let f = eq("status", "active");
        assert_eq!(merge_filters(Some(f.clone()), None, MergeStrategy::And), Some(f.clone()));
        assert_eq!(merge_filters(None, Some(f.clone()), MergeStrategy::Or), Some(f));
        assert_eq!(merge_filters(None, None, MergeStrategy::And), None);
    }

    #[test]
    fn test_merge_wraps_both() {
        let a = eq("a", "1");
        let b = eq("b", "2");
        assert_eq!(
            merge_filters(Some(a.clone()), Some(b.clone()), MergeStrategy::And),
            Some(FilterNode::And(vec![a, b]))
        );
    }

    #[test]
    fn test_comparisons_and_prefix() {
        let f = FilterNode::Or(vec![eq("a", "1"), FilterNode::Not(Box::new(eq("b.c", "2")))]);
        let paths: Vec<String> = f.comparisons().iter().map(|c| c.path.to_string()).collect();
        assert_eq!(paths, vec!["a", "b.c"]);

        let prefixed = f.prefixed(&["tags_id".to_string()]);
        let paths: Vec<String> = prefixed
            .comparisons()
            .iter()
            .map(|c| c.path.to_string())
            .collect();
        assert_eq!(paths, vec!["tags_id.a", "tags_id.b.c"]);
    }
}
