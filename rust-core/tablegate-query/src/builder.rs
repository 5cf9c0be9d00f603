// SPDX-License-Identifier: PMPL-1.0-or-later
//! Builder interface between compiled plans and store drivers.
//!
//! [`QueryPlan::build`] walks a plan in clause order and hands each part to a
//! [`QueryBuilder`]. [`SqlBuilder`] is the reference implementation: it
//! renders PostgreSQL-flavoured SQL with `$n` placeholders.

use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::path::FieldFunction;
use crate::plan::{
    ColumnRef, Join, JoinKind, OrderTerm, Operand, Predicate, Projection, ProjectionExpr, QueryPlan,
    RowScope,
};
use crate::query::AggregateFunction;
use crate::schema::FieldType;
use crate::value::Value;

/// Receives the clauses of a plan.
pub trait QueryBuilder {
    type Output;

    fn select(&mut self, table: &str, alias: &str, projections: &[Projection], distinct: bool);
    fn join(&mut self, join: &Join);
    fn where_clause(&mut self, predicate: &Predicate);
    fn group_by(&mut self, operands: &[Operand]);
    fn order_by(&mut self, terms: &[OrderTerm]);
    fn limit(&mut self, limit: u64);
    fn offset(&mut self, offset: u64);
    fn finish(self) -> Self::Output;
}

impl QueryPlan {
    /// Drive `builder` through this plan's clauses.
    pub fn build<B: QueryBuilder>(&self, mut builder: B) -> B::Output {
        builder.select(&self.collection, &self.alias, &self.projections, self.distinct);
        for join in &self.joins {
            builder.join(join);
        }
        if let Some(predicate) = &self.predicate {
            builder.where_clause(predicate);
        }
        if !self.group_by.is_empty() {
            builder.group_by(&self.group_by);
        }
        if !self.order_by.is_empty() {
            builder.order_by(&self.order_by);
        }
        if let Some(limit) = self.limit {
            builder.limit(limit);
        }
        if self.offset > 0 {
            builder.offset(self.offset);
        }
        builder.finish()
    }

    /// Render with [`SqlBuilder`].
    pub fn to_sql(&self) -> SqlQuery {
        self.build(SqlBuilder::default())
    }
}

/// Rendered SQL text and its positional parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

/// PostgreSQL renderer.
///
/// Clauses are collected first and rendered in [`QueryBuilder::finish`],
/// because columns are only qualified when the plan has joins. Parameters
/// are numbered in text order, subqueries included.
#[derive(Debug, Default)]
pub struct SqlBuilder {
    /// Parameters bound by enclosing query text.
    params: Vec<Value>,
    table: String,
    alias: String,
    distinct: bool,
    projections: Vec<Projection>,
    joins: Vec<Join>,
    predicate: Option<Predicate>,
    group_by: Vec<Operand>,
    order_by: Vec<OrderTerm>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl SqlBuilder {
    /// Builder for a subquery whose placeholders continue after `params`.
    fn continuing(params: Vec<Value>) -> Self {
        Self {
            params,
            ..Self::default()
        }
    }
}

impl QueryBuilder for SqlBuilder {
    type Output = SqlQuery;

    fn select(&mut self, table: &str, alias: &str, projections: &[Projection], distinct: bool) {
        self.table = table.to_string();
        self.alias = alias.to_string();
        self.projections = projections.to_vec();
        self.distinct = distinct;
    }

    fn join(&mut self, join: &Join) {
        self.joins.push(join.clone());
    }

    fn where_clause(&mut self, predicate: &Predicate) {
        self.predicate = Some(predicate.clone());
    }

    fn group_by(&mut self, operands: &[Operand]) {
        self.group_by = operands.to_vec();
    }

    fn order_by(&mut self, terms: &[OrderTerm]) {
        self.order_by = terms.to_vec();
    }

    fn limit(&mut self, limit: u64) {
        self.limit = Some(limit);
    }

    fn offset(&mut self, offset: u64) {
        self.offset = Some(offset);
    }

    fn finish(self) -> SqlQuery {
        let mut renderer = Renderer {
            qualify: !self.joins.is_empty(),
            params: self.params,
        };
        let mut sql = String::from("SELECT ");
        if self.distinct {
            sql.push_str("DISTINCT ");
        }

        let columns: Vec<String> = self
            .projections
            .iter()
            .map(|p| renderer.projection(p))
            .collect();
        if columns.is_empty() {
            sql.push('*');
        } else {
            sql.push_str(&columns.join(", "));
        }

        let _ = write!(sql, " FROM {}", quote(&self.table));
        if self.alias != self.table {
            let _ = write!(sql, " AS {}", quote(&self.alias));
        }
        for join in &self.joins {
            let kind = match join.kind {
                JoinKind::Left => "LEFT JOIN",
            };
            let _ = write!(
                sql,
                " {kind} {} AS {} ON {} = {}",
                quote(&join.table),
                quote(&join.alias),
                renderer.column(&join.left),
                renderer.column(&join.right)
            );
            if let Some(scope) = &join.scope {
                let restriction = renderer.scope(&join.alias, scope);
                let _ = write!(sql, " AND {restriction}");
            }
        }
        if let Some(predicate) = &self.predicate {
            let clause = renderer.predicate(predicate, false);
            let _ = write!(sql, " WHERE {clause}");
        }
        if !self.group_by.is_empty() {
            let groups: Vec<String> = self.group_by.iter().map(|o| renderer.operand(o)).collect();
            let _ = write!(sql, " GROUP BY {}", groups.join(", "));
        }
        if !self.order_by.is_empty() {
            let terms: Vec<String> = self
                .order_by
                .iter()
                .map(|t| {
                    let dir = if t.descending { "DESC" } else { "ASC" };
                    format!("{} {dir}", renderer.operand(&t.operand))
                })
                .collect();
            let _ = write!(sql, " ORDER BY {}", terms.join(", "));
        }
        if let Some(limit) = self.limit {
            let _ = write!(sql, " LIMIT {limit}");
        }
        if let Some(offset) = self.offset {
            let _ = write!(sql, " OFFSET {offset}");
        }

        SqlQuery {
            sql,
            params: renderer.params,
        }
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

struct Renderer {
    qualify: bool,
    params: Vec<Value>,
}

impl Renderer {
    fn bind(&mut self, value: &Value) -> String {
        self.params.push(value.clone());
        format!("${}", self.params.len())
    }

    fn column(&self, column: &ColumnRef) -> String {
        if self.qualify {
            format!("{}.{}", quote(&column.alias), quote(&column.column))
        } else {
            quote(&column.column)
        }
    }

    /// Render `plan` inline, sharing this renderer's placeholders.
    fn subquery(&mut self, plan: &QueryPlan) -> String {
        let params = std::mem::take(&mut self.params);
        let rendered = plan.build(SqlBuilder::continuing(params));
        self.params = rendered.params;
        rendered.sql
    }

    /// `alias.column IN (...)`, always qualified.
    fn scope(&mut self, alias: &str, scope: &RowScope) -> String {
        let subquery = self.subquery(&scope.plan);
        format!("{}.{} IN ({subquery})", quote(alias), quote(&scope.column))
    }

    fn operand(&mut self, operand: &Operand) -> String {
        match operand {
            Operand::Column(column) => self.column(column),
            Operand::Function {
                function,
                column,
                field_type,
            } => {
                let column = self.column(column);
                match function {
                    FieldFunction::Count if *field_type == FieldType::Csv => {
                        format!("array_length(string_to_array({column}, ','), 1)")
                    }
                    FieldFunction::Count => format!("json_array_length({column})"),
                    FieldFunction::Year => format!("EXTRACT(YEAR FROM {column})"),
                    FieldFunction::Month => format!("EXTRACT(MONTH FROM {column})"),
                    FieldFunction::Week => format!("EXTRACT(WEEK FROM {column})"),
                    FieldFunction::Day => format!("EXTRACT(DAY FROM {column})"),
                    FieldFunction::Weekday => format!("EXTRACT(DOW FROM {column})"),
                    FieldFunction::Hour => format!("EXTRACT(HOUR FROM {column})"),
                    FieldFunction::Minute => format!("EXTRACT(MINUTE FROM {column})"),
                    FieldFunction::Second => format!("EXTRACT(SECOND FROM {column})"),
                }
            }
            Operand::RelatedCount {
                table,
                alias,
                foreign_key,
                parent,
                scope,
            } => {
                // The subquery always qualifies; its table may be the root.
                let parent = format!("{}.{}", quote(&parent.alias), quote(&parent.column));
                let restriction = match scope {
                    Some(scope) => format!(" AND {}", self.scope(alias, scope)),
                    None => String::new(),
                };
                format!(
                    "(SELECT COUNT(*) FROM {} AS {} WHERE {}.{} = {parent}{restriction})",
                    quote(table),
                    quote(alias),
                    quote(alias),
                    quote(foreign_key)
                )
            }
        }
    }

    fn projection(&mut self, projection: &Projection) -> String {
        let (expr, natural) = match &projection.expr {
            ProjectionExpr::Operand(operand) => {
                let natural = match operand {
                    Operand::Column(c) => Some(c.column.as_str()),
                    _ => None,
                };
                (self.operand(operand), natural)
            }
            ProjectionExpr::Aggregate { function, operand } => {
                let inner = match operand {
                    Some(operand) => self.operand(operand),
                    None => "*".to_string(),
                };
                let expr = match function {
                    AggregateFunction::Count | AggregateFunction::CountAll if operand.is_none() => {
                        "COUNT(*)".to_string()
                    }
                    AggregateFunction::Count => format!("COUNT({inner})"),
                    AggregateFunction::CountAll => "COUNT(*)".to_string(),
                    AggregateFunction::CountDistinct => format!("COUNT(DISTINCT {inner})"),
                    AggregateFunction::Sum => format!("SUM({inner})"),
                    AggregateFunction::SumDistinct => format!("SUM(DISTINCT {inner})"),
                    AggregateFunction::Avg => format!("AVG({inner})"),
                    AggregateFunction::AvgDistinct => format!("AVG(DISTINCT {inner})"),
                    AggregateFunction::Min => format!("MIN({inner})"),
                    AggregateFunction::Max => format!("MAX({inner})"),
                };
                (expr, None)
            }
        };

        if natural == Some(projection.output.as_str()) && !self.qualify {
            expr
        } else {
            format!("{expr} AS {}", quote(&projection.output))
        }
    }

    fn predicate(&mut self, predicate: &Predicate, nested: bool) -> String {
        match predicate {
            Predicate::Compare { operand, op, value } => {
                let lhs = self.operand(operand);
                let rhs = self.bind(value);
                format!("{lhs} {} {rhs}", op.as_sql())
            }
            Predicate::In { values, negated, .. } if values.is_empty() => {
                // `IN ()` is not valid SQL.
                self.predicate(&Predicate::Constant(*negated), nested)
            }
            Predicate::In {
                operand,
                values,
                negated,
            } => {
                let lhs = self.operand(operand);
                let placeholders: Vec<String> = values.iter().map(|v| self.bind(v)).collect();
                let not = if *negated { "NOT " } else { "" };
                format!("{lhs} {not}IN ({})", placeholders.join(", "))
            }
            Predicate::Between {
                operand,
                low,
                high,
                negated,
            } => {
                let lhs = self.operand(operand);
                let low = self.bind(low);
                let high = self.bind(high);
                let not = if *negated { "NOT " } else { "" };
                format!("{lhs} {not}BETWEEN {low} AND {high}")
            }
            Predicate::Like {
                operand,
                pattern,
                case_insensitive,
                negated,
            } => {
                let lhs = self.operand(operand);
                let rhs = self.bind(&Value::String(pattern.clone()));
                let not = if *negated { "NOT " } else { "" };
                let like = if *case_insensitive { "ILIKE" } else { "LIKE" };
                format!("{lhs} {not}{like} {rhs}")
            }
            Predicate::IsNull { operand, negated } => {
                let lhs = self.operand(operand);
                if *negated {
                    format!("{lhs} IS NOT NULL")
                } else {
                    format!("{lhs} IS NULL")
                }
            }
            Predicate::And(children) => self.group(children, " AND ", nested),
            Predicate::Or(children) => self.group(children, " OR ", nested),
            Predicate::Not(inner) => format!("NOT ({})", self.predicate(inner, false)),
            Predicate::Constant(true) => "1 = 1".to_string(),
            Predicate::Constant(false) => "1 = 0".to_string(),
        }
    }

    fn group(&mut self, children: &[Predicate], separator: &str, nested: bool) -> String {
        let parts: Vec<String> = children.iter().map(|c| self.predicate(c, true)).collect();
        let joined = parts.join(separator);
        if nested && parts.len() > 1 {
            format!("({joined})")
        } else {
            joined
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::CompareOp;

    #[test]
    fn test_simple_select() {
        let mut plan = QueryPlan::new("grants", "grants", "id");
        plan.projections.push(Projection::column(ColumnRef::new("grants", "id"), "id"));
        plan.projections.push(Projection::column(ColumnRef::new("grants", "title"), "title"));
        plan.predicate = Some(Predicate::Compare {
            operand: Operand::column("grants", "status"),
            op: CompareOp::Eq,
            value: Value::String("active".into()),
        });
        plan.limit = Some(100);

        let query = plan.to_sql();
        assert_eq!(
            query.sql,
            "SELECT \"id\", \"title\" FROM \"grants\" WHERE \"status\" = $1 LIMIT 100"
        );
        assert_eq!(query.params, vec![Value::String("active".into())]);
    }

    #[test]
    fn test_joined_columns_are_qualified() {
        let mut plan = QueryPlan::new("applications", "applications", "id");
        plan.projections.push(Projection::column(ColumnRef::new("n1", "name"), "ngo_id.name"));
        plan.joins.push(Join {
            kind: JoinKind::Left,
            table: "ngos".into(),
            alias: "n1".into(),
            left: ColumnRef::new("n1", "id"),
            right: ColumnRef::new("applications", "ngo_id"),
            fans_out: false,
            path: "ngo_id".into(),
            scope: None,
        });
        let sql = plan.to_sql().sql;
        assert_eq!(
            sql,
            "SELECT \"n1\".\"name\" AS \"ngo_id.name\" FROM \"applications\" \
             LEFT JOIN \"ngos\" AS \"n1\" ON \"n1\".\"id\" = \"applications\".\"ngo_id\""
        );
    }

    #[test]
    fn test_nested_groups_and_placeholders() {
        let mut plan = QueryPlan::new("grants", "grants", "id");
        plan.predicate = Some(Predicate::And(vec![
            Predicate::Or(vec![
                Predicate::In {
                    operand: Operand::column("grants", "category"),
                    values: vec![Value::String("a".into()), Value::String("b".into())],
                    negated: true,
                },
                Predicate::IsNull {
                    operand: Operand::column("grants", "category"),
                    negated: false,
                },
            ]),
            Predicate::Like {
                operand: Operand::column("grants", "title"),
                pattern: "%x%".into(),
                case_insensitive: true,
                negated: false,
            },
            Predicate::Not(Box::new(Predicate::Constant(false))),
        ]));
        let query = plan.to_sql();
        assert_eq!(
            query.sql,
            "SELECT * FROM \"grants\" WHERE (\"category\" NOT IN ($1, $2) OR \"category\" IS NULL) \
             AND \"title\" ILIKE $3 AND NOT (1 = 0)"
        );
        assert_eq!(query.params.len(), 3);
    }

    #[test]
    fn test_functions_and_related_count() {
        let mut plan = QueryPlan::new("grants", "grants", "id");
        plan.predicate = Some(Predicate::And(vec![
            Predicate::Compare {
                operand: Operand::Function {
                    function: FieldFunction::Year,
                    column: ColumnRef::new("grants", "date_created"),
                    field_type: FieldType::DateTime,
                },
                op: CompareOp::Gte,
                value: Value::Int(2024),
            },
            Predicate::Compare {
                operand: Operand::RelatedCount {
                    table: "applications".into(),
                    alias: "c1".into(),
                    foreign_key: "grant_id".into(),
                    parent: ColumnRef::new("grants", "id"),
                    scope: None,
                },
                op: CompareOp::Gt,
                value: Value::Int(2),
            },
        ]));
        let sql = plan.to_sql().sql;
        assert!(sql.contains("EXTRACT(YEAR FROM \"date_created\") >= $1"));
        assert!(sql.contains(
            "(SELECT COUNT(*) FROM \"applications\" AS \"c1\" WHERE \"c1\".\"grant_id\" = \"grants\".\"id\") > $2"
        ));
    }

    fn org_scope(org: &str) -> RowScope {
        let mut plan = QueryPlan::new("ngos", "ngos", "id");
        plan.projections.push(Projection::column(ColumnRef::new("ngos", "id"), "id"));
        plan.predicate = Some(Predicate::Compare {
            operand: Operand::column("ngos", "organization_id"),
            op: CompareOp::Eq,
            value: Value::String(org.into()),
        });
        RowScope::new("id", plan)
    }

    #[test]
    fn test_scoped_join_numbers_params_in_text_order() {
        let mut plan = QueryPlan::new("applications", "applications", "id");
        plan.projections.push(Projection::column(ColumnRef::new("n1", "name"), "ngo_id.name"));
        plan.joins.push(Join {
            kind: JoinKind::Left,
            table: "ngos".into(),
            alias: "n1".into(),
            left: ColumnRef::new("n1", "id"),
            right: ColumnRef::new("applications", "ngo_id"),
            fans_out: false,
            path: "ngo_id".into(),
            scope: Some(org_scope("org-1")),
        });
        plan.predicate = Some(Predicate::Compare {
            operand: Operand::column("applications", "status"),
            op: CompareOp::Eq,
            value: Value::String("submitted".into()),
        });

        let query = plan.to_sql();
        assert_eq!(
            query.sql,
            "SELECT \"n1\".\"name\" AS \"ngo_id.name\" FROM \"applications\" \
             LEFT JOIN \"ngos\" AS \"n1\" ON \"n1\".\"id\" = \"applications\".\"ngo_id\" \
             AND \"n1\".\"id\" IN (SELECT \"id\" FROM \"ngos\" WHERE \"organization_id\" = $1) \
             WHERE \"applications\".\"status\" = $2"
        );
        assert_eq!(
            query.params,
            vec![Value::String("org-1".into()), Value::String("submitted".into())]
        );
    }

    #[test]
    fn test_scoped_related_count() {
        let mut plan = QueryPlan::new("yp_organizations", "yp_organizations", "id");
        plan.projections.push(Projection {
            expr: ProjectionExpr::Operand(Operand::RelatedCount {
                table: "ngos".into(),
                alias: "c1".into(),
                foreign_key: "organization_id".into(),
                parent: ColumnRef::new("yp_organizations", "id"),
                scope: Some(org_scope("org-1")),
            }),
            output: "count(ngos)".into(),
            hidden: false,
        });
        let query = plan.to_sql();
        assert!(query.sql.contains(
            "WHERE \"c1\".\"organization_id\" = \"yp_organizations\".\"id\" \
             AND \"c1\".\"id\" IN (SELECT \"id\" FROM \"ngos\" WHERE \"organization_id\" = $1))"
        ));
        assert_eq!(query.params, vec![Value::String("org-1".into())]);
    }

    #[test]
    fn test_empty_in_list() {
        let mut plan = QueryPlan::new("grants", "grants", "id");
        plan.predicate = Some(Predicate::In {
            operand: Operand::column("grants", "id"),
            values: Vec::new(),
            negated: false,
        });
        assert_eq!(plan.to_sql().sql, "SELECT * FROM \"grants\" WHERE 1 = 0");
    }

    #[test]
    fn test_identifiers_are_escaped() {
        let mut plan = QueryPlan::new("we\"ird", "we\"ird", "id");
        plan.projections.push(Projection::column(ColumnRef::new("we\"ird", "a\"b"), "a\"b"));
        assert_eq!(plan.to_sql().sql, "SELECT \"a\"\"b\" FROM \"we\"\"ird\"");
    }
}
