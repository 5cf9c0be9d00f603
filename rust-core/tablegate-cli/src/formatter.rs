// SPDX-License-Identifier: PMPL-1.0-or-later
//!
//! Output formatters for compiled plans.
//!
//! Supports three output modes:
//! - **Sql**: The rendered statement followed by its bound parameters.
//! - **Plan**: Pretty-printed JSON of the plan itself.
//! - **Table**: Joins and projections as `comfy-table` tables.

use comfy_table::{Cell, ContentArrangement, Table};
use std::fmt;
use tablegate_query::{
    MutationPlan, Operand, ProjectionExpr, QueryPlan, SchemaCatalog, SqlQuery, Value,
};

/// Available output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Sql,
    Plan,
    Table,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Sql => write!(f, "sql"),
            OutputFormat::Plan => write!(f, "plan"),
            OutputFormat::Table => write!(f, "table"),
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sql" => Ok(OutputFormat::Sql),
            "plan" | "json" => Ok(OutputFormat::Plan),
            "table" => Ok(OutputFormat::Table),
            other => Err(format!(
                "Unknown format '{other}'. Valid formats: sql, plan, table"
            )),
        }
    }
}

/// Format a read plan according to the selected output format.
pub fn format_plan(plan: &QueryPlan, format: OutputFormat) -> String {
    match format {
        OutputFormat::Sql => format_sql(plan),
        OutputFormat::Plan => to_pretty_json(plan),
        OutputFormat::Table => format_tables(plan),
    }
}

/// Format a mutation plan. The payload is shown as JSON in every mode.
pub fn format_mutation(plan: &MutationPlan, format: OutputFormat) -> String {
    if format == OutputFormat::Plan {
        return to_pretty_json(plan);
    }

    let mut out = format!("{} {} (key {})\n", plan.action, plan.collection, plan.primary_key);
    if let Some(payload) = &plan.payload {
        out.push_str(&format!("payload: {}\n", serde_json::Value::Object(payload.clone())));
    }
    match &plan.scope {
        Some(scope) => {
            out.push_str("scope:\n");
            out.push_str(&format_plan(scope, format));
        }
        None => out.push_str("scope: none\n"),
    }
    out
}

/// Pretty-print a reduced schema as JSON.
pub fn format_schema(schema: &SchemaCatalog) -> String {
    to_pretty_json(schema)
}

fn to_pretty_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("<unserializable: {e}>"))
}

// ---------------------------------------------------------------------------
// SQL
// ---------------------------------------------------------------------------

/// Render the statement, its parameters, and every nested statement.
fn format_sql(plan: &QueryPlan) -> String {
    let mut out = render_statement(&plan.to_sql());

    if let Some(meta) = &plan.meta {
        if let Some(total) = &meta.total_count {
            out.push_str("-- total_count\n");
            out.push_str(&render_statement(&total.to_sql()));
        }
        if let Some(filtered) = &meta.filter_count {
            out.push_str("-- filter_count\n");
            out.push_str(&render_statement(&filtered.to_sql()));
        }
    }

    for nested in &plan.nested {
        out.push_str(&format!(
            "-- nested {} (bound on {} = parent {})\n",
            nested.field, nested.link, nested.parent_key
        ));
        out.push_str(&format_sql(&nested.plan));
    }
    out
}

fn render_statement(query: &SqlQuery) -> String {
    let mut out = format!("{};\n", query.sql);
    for (i, param) in query.params.iter().enumerate() {
        out.push_str(&format!("  ${} = {}\n", i + 1, param_to_cell(param)));
    }
    out
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// Render joins and projections as two tables plus a summary line.
fn format_tables(plan: &QueryPlan) -> String {
    let mut joins = Table::new();
    joins.set_content_arrangement(ContentArrangement::Dynamic);
    joins.set_header(vec!["path", "table", "alias", "on", "fans out", "scoped"]);
    for join in &plan.joins {
        joins.add_row(vec![
            Cell::new(&join.path),
            Cell::new(&join.table),
            Cell::new(&join.alias),
            Cell::new(format!("{} = {}", join.left, join.right)),
            Cell::new(if join.fans_out { "yes" } else { "" }),
            Cell::new(match &join.scope {
                Some(scope) => format!("{} in {}", scope.column, scope.plan.collection),
                None => String::new(),
            }),
        ]);
    }

    let mut projections = Table::new();
    projections.set_content_arrangement(ContentArrangement::Dynamic);
    projections.set_header(vec!["output", "expression", "hidden"]);
    for projection in &plan.projections {
        projections.add_row(vec![
            Cell::new(&projection.output),
            Cell::new(describe_projection(&projection.expr)),
            Cell::new(if projection.hidden { "yes" } else { "" }),
        ]);
    }

    let row_count = plan.joins.len();
    let mut out = format!(
        "{} ({})\n{joins}\n({row_count} join{})\n{projections}\n",
        plan.collection,
        plan.alias,
        if row_count == 1 { "" } else { "s" }
    );
    out.push_str(&format!(
        "distinct: {}, limit: {}, offset: {}, nested: {}\n",
        plan.distinct,
        plan.limit.map_or_else(|| "none".to_string(), |l| l.to_string()),
        plan.offset,
        plan.nested.len()
    ));
    for nested in &plan.nested {
        out.push_str(&format!("\n-- nested {}\n", nested.field));
        out.push_str(&format_tables(&nested.plan));
    }
    out
}

fn describe_projection(expr: &ProjectionExpr) -> String {
    match expr {
        ProjectionExpr::Operand(operand) => describe_operand(operand),
        ProjectionExpr::Aggregate { function, operand } => match operand {
            Some(operand) => format!("{function}({})", describe_operand(operand)),
            None => format!("{function}(*)"),
        },
    }
}

fn describe_operand(operand: &Operand) -> String {
    match operand {
        Operand::Column(column) => column.to_string(),
        Operand::Function { function, column, .. } => format!("{function}({column})"),
        Operand::RelatedCount { table, foreign_key, parent, .. } => {
            format!("count({table}.{foreign_key} = {parent})")
        }
    }
}

/// Convert a bound value to a short string for display.
///
/// Long lists are truncated to avoid overwhelming the output.
fn param_to_cell(value: &Value) -> String {
    match value {
        Value::List(items) if items.len() > 3 => format!("[{} items]", items.len()),
        other => other.to_string(),
    }
}
