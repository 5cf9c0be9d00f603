// SPDX-License-Identifier: PMPL-1.0-or-later
//! Compiled plan types.
//!
//! A [`QueryPlan`] is the immutable output of compilation: the store-facing
//! description of one SELECT with every identifier resolved against the
//! catalog and every literal held as a bound [`Value`]. Builders turn it into
//! concrete query text; callers may also serialize it or use
//! [`QueryPlan::fingerprint`] as a cache key.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};

use crate::path::FieldFunction;
use crate::permissions::Action;
use crate::query::AggregateFunction;
use crate::schema::FieldType;
use crate::value::Value;

/// `alias.column`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    pub alias: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(alias: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            column: column.into(),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.alias, self.column)
    }
}

/// Something a predicate, projection or ordering can refer to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Column(ColumnRef),
    /// Date part or element count of a column.
    Function {
        function: FieldFunction,
        column: ColumnRef,
        field_type: FieldType,
    },
    /// Number of related rows: `(SELECT COUNT(*) FROM table AS alias
    /// WHERE alias.foreign_key = parent)`.
    RelatedCount {
        table: String,
        alias: String,
        foreign_key: String,
        parent: ColumnRef,
        /// Only related rows the caller may read are counted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<RowScope>,
    },
}

impl Operand {
    pub fn column(alias: impl Into<String>, column: impl Into<String>) -> Self {
        Operand::Column(ColumnRef::new(alias, column))
    }
}

/// Binary comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    pub fn as_sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Neq => "<>",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
        }
    }
}

/// Compiled WHERE tree. Literals are always bound values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Compare {
        operand: Operand,
        op: CompareOp,
        value: Value,
    },
    In {
        operand: Operand,
        values: Vec<Value>,
        negated: bool,
    },
    Between {
        operand: Operand,
        low: Value,
        high: Value,
        negated: bool,
    },
    /// `LIKE` / `ILIKE`; `pattern` is already escaped and wildcarded.
    Like {
        operand: Operand,
        pattern: String,
        case_insensitive: bool,
        negated: bool,
    },
    IsNull {
        operand: Operand,
        negated: bool,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Constant(bool),
}

impl Predicate {
    /// AND of the given predicates, flattening trivial cases.
    pub fn all(mut predicates: Vec<Predicate>) -> Option<Predicate> {
        match predicates.len() {
            0 => None,
            1 => predicates.pop(),
            _ => Some(Predicate::And(predicates)),
        }
    }

    /// Bound values in rendering order.
    pub fn values(&self) -> Vec<&Value> {
        let mut out = Vec::new();
        self.collect_values(&mut out);
        out
    }

    fn collect_values<'a>(&'a self, out: &mut Vec<&'a Value>) {
        match self {
            Predicate::Compare { value, .. } => out.push(value),
            Predicate::In { values, .. } => out.extend(values.iter()),
            Predicate::Between { low, high, .. } => {
                out.push(low);
                out.push(high);
            }
            Predicate::Like { .. } | Predicate::IsNull { .. } | Predicate::Constant(_) => {}
            Predicate::And(children) | Predicate::Or(children) => {
                for child in children {
                    child.collect_values(out);
                }
            }
            Predicate::Not(inner) => inner.collect_values(out),
        }
    }
}

/// Read scope of a related table: `alias.column IN (plan)`.
///
/// `plan` selects the keys of the rows the caller may read; it is
/// self-contained and never refers to aliases of the enclosing plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowScope {
    pub column: String,
    pub plan: Box<QueryPlan>,
}

impl RowScope {
    pub fn new(column: impl Into<String>, plan: QueryPlan) -> Self {
        Self {
            column: column.into(),
            plan: Box::new(plan),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    Left,
}

/// One joined table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub kind: JoinKind,
    pub table: String,
    pub alias: String,
    /// Column of the joined table.
    pub left: ColumnRef,
    /// Column of an already-present alias.
    pub right: ColumnRef,
    /// Whether the join can multiply parent rows.
    pub fans_out: bool,
    /// Dot-path that introduced the join.
    pub path: String,
    /// Extra ON condition hiding related rows the caller may not read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<RowScope>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionExpr {
    Operand(Operand),
    /// `operand` is `None` for `COUNT(*)`.
    Aggregate {
        function: AggregateFunction,
        operand: Option<Operand>,
    },
}

/// One output column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub expr: ProjectionExpr,
    pub output: String,
    /// Selected only to stitch nested results; not part of the response.
    #[serde(default)]
    pub hidden: bool,
}

impl Projection {
    pub fn column(column: ColumnRef, output: impl Into<String>) -> Self {
        Self {
            expr: ProjectionExpr::Operand(Operand::Column(column)),
            output: output.into(),
            hidden: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderTerm {
    pub operand: Operand,
    pub descending: bool,
}

/// A to-many selection fetched as a second query.
///
/// The driver runs the parent plan, collects the values of `parent_key`
/// from its rows, and runs [`NestedPlan::bind_parent_keys`]. Rows are
/// matched back through `link_output`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedPlan {
    /// Output path of the relation in parent rows.
    pub field: String,
    /// Output path of the parent column holding the matched key.
    pub parent_key: String,
    /// Column of the nested root matched against parent keys.
    pub link: ColumnRef,
    /// Output path of `link` in nested rows.
    pub link_output: String,
    /// Rows kept per parent, applied by the driver.
    pub per_parent_limit: Option<u64>,
    pub per_parent_offset: u64,
    pub plan: QueryPlan,
}

impl NestedPlan {
    /// The nested plan restricted to the given parent keys.
    ///
    /// No keys selects nothing.
    pub fn bind_parent_keys(&self, keys: &[Value]) -> QueryPlan {
        let link = if keys.is_empty() {
            Predicate::Constant(false)
        } else {
            Predicate::In {
                operand: Operand::Column(self.link.clone()),
                values: keys.to_vec(),
                negated: false,
            }
        };
        let mut plan = self.plan.clone();
        plan.predicate = Predicate::all(plan.predicate.take().into_iter().chain([link]).collect());
        plan
    }
}

/// Count queries requested through `meta`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaPlan {
    /// Rows visible under the permission scope alone.
    pub total_count: Option<Box<QueryPlan>>,
    /// Rows matching the full request filter and search.
    pub filter_count: Option<Box<QueryPlan>>,
}

/// A compiled SELECT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub collection: String,
    pub alias: String,
    pub primary_key: String,
    pub distinct: bool,
    pub projections: Vec<Projection>,
    pub joins: Vec<Join>,
    pub predicate: Option<Predicate>,
    pub group_by: Vec<Operand>,
    pub order_by: Vec<OrderTerm>,
    pub limit: Option<u64>,
    pub offset: u64,
    #[serde(default)]
    pub nested: Vec<NestedPlan>,
    #[serde(default)]
    pub meta: Option<MetaPlan>,
}

impl QueryPlan {
    /// Empty plan over `collection`.
    pub fn new(collection: &str, alias: &str, primary_key: &str) -> Self {
        Self {
            collection: collection.to_string(),
            alias: alias.to_string(),
            primary_key: primary_key.to_string(),
            distinct: false,
            projections: Vec::new(),
            joins: Vec::new(),
            predicate: None,
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: 0,
            nested: Vec::new(),
            meta: None,
        }
    }

    /// Stable SHA-256 hex digest of the plan.
    pub fn fingerprint(&self) -> String {
        let text = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect()
    }

    pub fn join_for(&self, path: &str) -> Option<&Join> {
        self.joins.iter().find(|j| j.path == path)
    }

    /// Output names the caller will see.
    pub fn visible_outputs(&self) -> Vec<&str> {
        self.projections
            .iter()
            .filter(|p| !p.hidden)
            .map(|p| p.output.as_str())
            .collect()
    }
}

/// A compiled write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationPlan {
    pub action: Action,
    pub collection: String,
    pub primary_key: String,
    /// Payload after presets, for `create` and `update`.
    pub payload: Option<Map<String, JsonValue>>,
    /// Selects the primary keys the caller may touch (`update`/`delete`).
    pub scope: Option<QueryPlan>,
}
