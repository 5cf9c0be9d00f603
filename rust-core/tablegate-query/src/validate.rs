// SPDX-License-Identifier: PMPL-1.0-or-later
//! Query validation.
//!
//! Resolves every path in a normalized [`Query`] against the catalog and
//! checks operator/type compatibility, relational depth and the structural
//! rules of sorting and aggregation. Nothing is rewritten here; a query that
//! passes can be compiled without further schema errors.

use tracing::debug;

use crate::config::CompilerConfig;
use crate::error::{QueryError, Result};
use crate::filter::{Comparison, FilterNode, Operator};
use crate::path::{FieldFunction, FieldPath};
use crate::query::{DeepQuery, Query, SortSpec};
use crate::schema::{FieldType, ResolvedPath, SchemaCatalog};

/// Validates queries against one catalog snapshot.
#[derive(Debug, Clone, Copy)]
pub struct Validator<'a> {
    catalog: &'a SchemaCatalog,
    config: &'a CompilerConfig,
}

impl<'a> Validator<'a> {
    pub fn new(catalog: &'a SchemaCatalog, config: &'a CompilerConfig) -> Self {
        Self { catalog, config }
    }

    /// Validate a whole query rooted at `collection`.
    pub fn validate(&self, collection: &str, query: &Query) -> Result<()> {
        for field in &query.fields {
            self.field_path(collection, field, 0)?;
        }
        if let Some(filter) = &query.filter {
            self.filter(collection, filter, Some(0))?;
        }
        for sort in &query.sort {
            self.sort(collection, sort, 0)?;
        }
        for group in &query.group_by {
            self.column_path(collection, group, "groupBy")?;
        }
        for aggregate in &query.aggregate {
            if aggregate.field.is_wildcard() && aggregate.field.depth() == 0 {
                if !aggregate.function.accepts_wildcard() {
                    return Err(QueryError::TypeMismatch {
                        path: aggregate.field.to_string(),
                        operator: aggregate.function.to_string(),
                        reason: "only counting functions accept *".to_string(),
                    });
                }
                continue;
            }
            let resolved = self.column_path(collection, &aggregate.field, "aggregate")?;
            let numeric = resolved
                .field
                .map(|f| f.field_type.is_numeric())
                .unwrap_or(false);
            if aggregate.function.requires_numeric() && !numeric {
                return Err(QueryError::TypeMismatch {
                    path: aggregate.field.to_string(),
                    operator: aggregate.function.to_string(),
                    reason: "field is not numeric".to_string(),
                });
            }
        }
        for target in query.alias.values() {
            self.column_path(collection, target, "alias")?;
        }

        if query.is_aggregating() {
            for field in &query.fields {
                if !field.is_wildcard() && !query.group_by.contains(field) {
                    return Err(QueryError::invalid(format!(
                        "field \"{field}\" must appear in groupBy when aggregating"
                    )));
                }
            }
        }

        for (relation, deep) in &query.deep {
            self.deep(collection, relation, deep, 1)?;
        }

        debug!(collection, "Validated query");
        Ok(())
    }

    /// Validate a filter. `depth_base` is the number of hops already taken
    /// to reach `collection`; `None` skips the depth limit (trusted filters).
    pub fn filter(&self, collection: &str, filter: &FilterNode, depth_base: Option<usize>) -> Result<()> {
        match filter {
            FilterNode::Comparison(c) => self.comparison(collection, c, depth_base),
            FilterNode::And(children) | FilterNode::Or(children) => children
                .iter()
                .try_for_each(|child| self.filter(collection, child, depth_base)),
            FilterNode::Not(inner) => self.filter(collection, inner, depth_base),
            FilterNode::False => Ok(()),
        }
    }

    fn check_depth(&self, path: &FieldPath, depth_base: usize) -> Result<()> {
        let depth = depth_base + path.depth();
        if depth > self.config.max_relational_depth {
            return Err(QueryError::QueryTooComplex {
                path: path.to_string(),
                depth,
                max: self.config.max_relational_depth,
            });
        }
        Ok(())
    }

    fn field_path(&self, collection: &str, path: &FieldPath, depth_base: usize) -> Result<ResolvedPath<'a>> {
        self.check_depth(path, depth_base)?;
        self.catalog.walk(collection, path)
    }

    /// A path that must end on a real column reached through to-one hops.
    fn column_path(&self, collection: &str, path: &FieldPath, context: &str) -> Result<ResolvedPath<'a>> {
        let resolved = self.field_path(collection, path, 0)?;
        if resolved.field.is_none() {
            return Err(QueryError::invalid(format!("\"*\" is not allowed in {context}")));
        }
        if resolved.through_to_many() || resolved.ends_to_many() {
            return Err(QueryError::invalid(format!(
                "{context} path \"{path}\" goes through a to-many relation"
            )));
        }
        Ok(resolved)
    }

    fn sort(&self, collection: &str, sort: &SortSpec, depth_base: usize) -> Result<()> {
        let resolved = self.field_path(collection, &sort.path, depth_base)?;
        if resolved.field.is_none() {
            return Err(QueryError::invalid("cannot sort by \"*\""));
        }
        if resolved.through_to_many() || resolved.ends_to_many() {
            return Err(QueryError::invalid(format!(
                "cannot sort by \"{}\": it goes through a to-many relation",
                sort.path
            )));
        }
        Ok(())
    }

    fn comparison(&self, collection: &str, c: &Comparison, depth_base: Option<usize>) -> Result<()> {
        if let Some(base) = depth_base {
            self.check_depth(&c.path, base)?;
        }
        let resolved = self.catalog.walk(collection, &c.path)?;
        let Some(field) = resolved.field else {
            return Err(QueryError::invalid("\"*\" cannot be used in a filter"));
        };

        let mismatch = |reason: &str| QueryError::TypeMismatch {
            path: c.path.to_string(),
            operator: c.operator.to_string(),
            reason: reason.to_string(),
        };
        let field_type = field.field_type;

        match c.path.function() {
            Some(FieldFunction::Count) => {
                if !matches!(field_type, FieldType::Json | FieldType::Csv | FieldType::Alias) {
                    return Err(mismatch("count() needs a json, csv or to-many field"));
                }
            }
            Some(_) if !field_type.is_temporal() => {
                return Err(mismatch("date functions need a date or time field"));
            }
            Some(_) => {}
            None if field_type == FieldType::Alias => {
                return Err(mismatch("to-many relations can only be compared through count()"));
            }
            None => {}
        }
        let has_function = c.path.function().is_some();

        if c.operator.is_pattern() && (has_function || !field_type.is_string_like()) {
            return Err(mismatch("pattern operators need a text field"));
        }
        if c.operator.is_ordering()
            && !has_function
            && !(field_type.is_numeric() || field_type.is_temporal() || field_type.is_string_like())
        {
            return Err(mismatch("field has no ordering"));
        }
        if matches!(c.operator, Operator::Empty | Operator::NEmpty)
            && (has_function
                || !(field_type.is_string_like() || field_type == FieldType::Json))
        {
            return Err(mismatch("emptiness only applies to text, json or csv fields"));
        }

        if !c.operator.is_flag() {
            let value_type = comparison_value_type(c.path.function(), field_type, c.operator);
            if c.value.coerce(value_type).is_none() {
                return Err(mismatch(&format!(
                    "value {} is not a valid {value_type}",
                    c.value
                )));
            }
        }
        Ok(())
    }

    fn deep(&self, collection: &str, relation: &str, deep: &DeepQuery, depth: usize) -> Result<()> {
        let path = FieldPath::from_segments([relation]);
        let resolved = self.catalog.walk(collection, &path)?;
        let hop = self.catalog.hop(&resolved.collection.name, relation).ok_or_else(|| {
            QueryError::invalid(format!("deep key \"{relation}\" is not a relational field"))
        })?;
        if depth > self.config.max_relational_depth {
            return Err(QueryError::QueryTooComplex {
                path: relation.to_string(),
                depth,
                max: self.config.max_relational_depth,
            });
        }

        let target = hop.target();
        if let Some(filter) = &deep.filter {
            self.filter(target, filter, Some(depth))?;
        }
        for sort in &deep.sort {
            self.sort(target, sort, depth)?;
        }
        for (nested, sub) in &deep.deep {
            self.deep(target, nested, sub, depth + 1)?;
        }
        Ok(())
    }
}

/// Type a comparison value must coerce to.
///
/// Function results are integers; pattern operators always take text.
pub fn comparison_value_type(
    function: Option<FieldFunction>,
    field_type: FieldType,
    operator: Operator,
) -> FieldType {
    if function.is_some() {
        FieldType::Integer
    } else if operator.is_pattern() {
        FieldType::String
    } else {
        field_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::grants_catalog;
    use crate::query::{Aggregate, AggregateFunction};
    use crate::value::Value;

    fn path(raw: &str) -> FieldPath {
        FieldPath::parse(raw).unwrap()
    }

    fn filter(raw: &str, op: Operator, value: Value) -> Query {
        Query {
            filter: Some(FilterNode::compare(raw, op, value).unwrap()),
            ..Query::default()
        }
    }

    fn check(collection: &str, query: &Query) -> Result<()> {
        let catalog = grants_catalog();
        let config = CompilerConfig::default();
        Validator::new(&catalog, &config).validate(collection, query)
    }

    #[test]
    fn test_valid_relational_filter() {
        let q = filter("ngo_id.organization_id", Operator::Eq, Value::String("7f1d3e2a-0000-4000-8000-000000000001".into()));
        assert!(check("applications", &q).is_ok());
    }

    #[test]
    fn test_unknown_field() {
        let q = Query {
            fields: vec![path("ngo_id.nickname")],
            ..Query::default()
        };
        assert_eq!(
            check("applications", &q),
            Err(QueryError::UnknownField {
                collection: "applications".into(),
                path: "ngo_id.nickname".into(),
            })
        );
    }

    #[test]
    fn test_pattern_on_number_is_mismatch() {
        let q = filter("score", Operator::Contains, Value::String("4".into()));
        assert!(matches!(check("applications", &q), Err(QueryError::TypeMismatch { .. })));
    }

    #[test]
    fn test_value_coercion() {
        let q = filter("score", Operator::Gt, Value::String("abc".into()));
        assert!(matches!(check("applications", &q), Err(QueryError::TypeMismatch { .. })));
        let q = filter("score", Operator::Gt, Value::String("3.5".into()));
        assert!(check("applications", &q).is_ok());
        let q = filter("ngo_id", Operator::Eq, Value::String("not-a-uuid".into()));
        assert!(matches!(check("applications", &q), Err(QueryError::TypeMismatch { .. })));
    }

    #[test]
    fn test_functions() {
        let q = filter("year(submitted_at)", Operator::Eq, Value::Int(2025));
        assert!(check("applications", &q).is_ok());
        let q = filter("year(title)", Operator::Eq, Value::Int(2025));
        assert!(matches!(check("applications", &q), Err(QueryError::TypeMismatch { .. })));
        let q = filter("count(applications)", Operator::Gt, Value::Int(3));
        assert!(check("grants", &q).is_ok());
    }

    #[test]
    fn test_alias_field_requires_count() {
        let q = filter("applications", Operator::Eq, Value::Int(3));
        assert!(matches!(check("grants", &q), Err(QueryError::TypeMismatch { .. })));
    }

    #[test]
    fn test_depth_boundary() {
        let at_limit = format!("{}name", "parent.".repeat(10));
        let over_limit = format!("{}name", "parent.".repeat(11));
        let q = filter(&at_limit, Operator::Eq, Value::String("x".into()));
        assert!(check("categories", &q).is_ok());
        let q = filter(&over_limit, Operator::Eq, Value::String("x".into()));
        assert!(matches!(
            check("categories", &q),
            Err(QueryError::QueryTooComplex { depth: 11, max: 10, .. })
        ));
    }

    #[test]
    fn test_sort_through_to_many_rejected() {
        let q = Query {
            sort: vec!["-applications.score".parse().unwrap()],
            ..Query::default()
        };
        assert!(matches!(check("grants", &q), Err(QueryError::InvalidQuery(_))));
    }

    #[test]
    fn test_aggregate_rules() {
        let q = Query {
            aggregate: vec![Aggregate::new(AggregateFunction::Sum, path("title"))],
            ..Query::default()
        };
        assert!(matches!(check("grants", &q), Err(QueryError::TypeMismatch { .. })));

        let q = Query {
            fields: vec![path("title")],
            aggregate: vec![Aggregate::new(AggregateFunction::Count, path("id"))],
            group_by: vec![path("category")],
            ..Query::default()
        };
        assert!(matches!(check("grants", &q), Err(QueryError::InvalidQuery(_))));

        let q = Query {
            fields: vec![path("category")],
            aggregate: vec![Aggregate::new(AggregateFunction::CountAll, path("*"))],
            group_by: vec![path("category")],
            ..Query::default()
        };
        assert!(check("grants", &q).is_ok());
    }

    #[test]
    fn test_deep_paths_are_relative() {
        let mut q = Query::default();
        q.deep.insert(
            "applications".into(),
            DeepQuery {
                filter: Some(FilterNode::compare("status", Operator::Eq, Value::String("submitted".into())).unwrap()),
                ..DeepQuery::default()
            },
        );
        assert!(check("grants", &q).is_ok());

        q.deep.insert("title".into(), DeepQuery::default());
        assert!(matches!(check("grants", &q), Err(QueryError::InvalidQuery(_))));
    }

    #[test]
    fn test_trusted_filters_skip_depth() {
        let catalog = grants_catalog();
        let config = CompilerConfig {
            max_relational_depth: 1,
            ..CompilerConfig::default()
        };
        let f = FilterNode::compare("parent.parent.name", Operator::Eq, Value::String("x".into())).unwrap();
        let validator = Validator::new(&catalog, &config);
        assert!(validator.filter("categories", &f, None).is_ok());
        assert!(validator.filter("categories", &f, Some(0)).is_err());
    }
}
