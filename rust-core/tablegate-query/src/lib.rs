// SPDX-License-Identifier: PMPL-1.0-or-later
//! TableGate Query
//!
//! Query compilation and permission enforcement for schema-driven table APIs.
//! Untrusted query parameters (filter trees, relational dot-paths, sort,
//! fields, aggregates, pagination) are normalized, validated against a
//! schema catalog, scoped by the caller's permission rules and compiled into
//! an immutable [`QueryPlan`] for a store driver to execute.
//!
//! ```text
//! RawQuery -> Normalizer -> Query -> Validator -> PermissionResolver
//!          -> JoinResolver -> Compiler -> QueryPlan -> QueryBuilder
//! ```

pub mod accountability;
pub mod builder;
pub mod compiler;
pub mod config;
pub mod error;
pub mod filter;
pub mod normalize;
pub mod path;
pub mod permissions;
pub mod plan;
pub mod query;
pub mod resolve;
pub mod schema;
pub mod validate;
pub mod value;

#[cfg(test)]
pub(crate) mod fixtures;

pub use accountability::Accountability;
pub use builder::{QueryBuilder, SqlBuilder, SqlQuery};
pub use compiler::Compiler;
pub use config::CompilerConfig;
pub use error::{QueryError, Result};
pub use filter::{merge_filters, Comparison, FilterNode, FilterParser, MergeStrategy, Operator};
pub use normalize::{normalize_query, Normalizer};
pub use path::{FieldFunction, FieldPath};
pub use permissions::{
    merge_rule_filters, reduce_schema, share_rules, Action, EffectivePermission, FieldList,
    PermissionResolver, PermissionRule, Share,
};
pub use plan::{
    ColumnRef, CompareOp, Join, JoinKind, MetaPlan, MutationPlan, NestedPlan, Operand, OrderTerm,
    Predicate, Projection, ProjectionExpr, QueryPlan, RowScope,
};
pub use query::{Aggregate, AggregateFunction, DeepQuery, MetaRequest, Query, RawQuery, SortSpec};
pub use resolve::{AliasMap, JoinResolver, RowScoper};
pub use schema::{Collection, Field, FieldType, Relation, RelationHop, SchemaCatalog};
pub use validate::Validator;
pub use value::Value;
