// SPDX-License-Identifier: PMPL-1.0-or-later
//! Query compiler.
//!
//! Turns a validated [`Query`] plus the caller's effective permissions into a
//! [`QueryPlan`]. Stages run in a fixed order so that permission denials
//! surface before any join is resolved and a failure never leaves a partial
//! plan behind.

use std::borrow::Cow;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};

use crate::accountability::Accountability;
use crate::config::CompilerConfig;
use crate::error::{QueryError, Result};
use crate::filter::{Comparison, FilterNode, Operator};
use crate::normalize::Normalizer;
use crate::path::FieldPath;
use crate::permissions::{
    reduce_schema, share_rules, Action, EffectivePermission, PermissionResolver, PermissionRule,
    Share,
};
use crate::plan::{
    ColumnRef, CompareOp, Join, MetaPlan, MutationPlan, NestedPlan, OrderTerm, Operand, Predicate,
    Projection, ProjectionExpr, QueryPlan,
};
use crate::query::{AggregateFunction, DeepQuery, Query, RawQuery, SortSpec};
use crate::resolve::{JoinResolver, RowScoper};
use crate::schema::{Collection, FieldType, RelationHop, SchemaCatalog};
use crate::validate::{comparison_value_type, Validator};
use crate::value::Value;

/// Compiles queries for one caller against one catalog snapshot.
///
/// Holds only shared references and request-local state, so a compiler can
/// be shared between threads; every compilation owns its own alias map.
#[derive(Debug, Clone)]
pub struct Compiler<'a> {
    catalog: &'a SchemaCatalog,
    rules: &'a [PermissionRule],
    accountability: &'a Accountability,
    config: &'a CompilerConfig,
    shared: Vec<PermissionRule>,
    now: DateTime<Utc>,
}

/// A to-many selection waiting to become a nested plan.
struct Selection {
    /// Path up to and including the to-many field.
    head: FieldPath,
    /// Alias of the collection owning the to-many field.
    owner_alias: String,
    hop: RelationHop,
    /// Paths relative to the related collection; `None` selects its keys.
    fields: Vec<Option<FieldPath>>,
}

impl<'a> Compiler<'a> {
    pub fn new(
        catalog: &'a SchemaCatalog,
        rules: &'a [PermissionRule],
        accountability: &'a Accountability,
        config: &'a CompilerConfig,
    ) -> Self {
        Self {
            catalog,
            rules,
            accountability,
            config,
            shared: Vec::new(),
            now: Utc::now(),
        }
    }

    /// Pin the instant `$NOW` resolves to.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Grant the read rules implied by `share`.
    pub fn with_share(mut self, share: &Share) -> Result<Self> {
        let rules = share_rules(self.catalog, self.rules, share)?;
        self.shared.extend(rules);
        Ok(self)
    }

    pub fn normalizer(&self) -> Normalizer<'a> {
        Normalizer::new(self.config, self.accountability).at(self.now)
    }

    fn permissions(&self) -> PermissionResolver<'_> {
        PermissionResolver::new(self.rules, self.accountability, self.config)
            .at(self.now)
            .with_shared(self.shared.clone())
    }

    /// The catalog as this caller may see it for `actions`.
    pub fn schema(&self, actions: &[Action]) -> Result<SchemaCatalog> {
        reduce_schema(self.catalog, self.rules, self.accountability, actions)
    }

    /// Normalize raw parameters and compile them.
    pub fn compile_raw(&self, collection: &str, raw: &RawQuery) -> Result<QueryPlan> {
        let query = self.normalizer().normalize(raw)?;
        self.compile(collection, &query)
    }

    /// Compile a read query.
    pub fn compile(&self, collection: &str, query: &Query) -> Result<QueryPlan> {
        // 1. Paths, operators and limits against the catalog.
        Validator::new(self.catalog, self.config).validate(collection, query)?;

        // 2. Permission scope, before any join exists.
        let permissions = self.permissions();
        let permission = permissions.effective(collection, Action::Read)?;

        let plan = self.select(&permissions, &permission, query, Some(query.limit))?;
        debug!(
            collection,
            joins = plan.joins.len(),
            nested = plan.nested.len(),
            distinct = plan.distinct,
            "Compiled query plan"
        );
        Ok(plan)
    }

    /// Compile a write.
    ///
    /// `create` and `update` take a payload; presets are applied on top of
    /// it and the result must satisfy the rules' validation filter.
    /// `update` and `delete` get a scope plan selecting the primary keys the
    /// caller may touch, narrowed by `query.filter` when given.
    pub fn compile_mutation(
        &self,
        action: Action,
        collection: &str,
        payload: Option<&Map<String, JsonValue>>,
        query: Option<&Query>,
    ) -> Result<MutationPlan> {
        if action == Action::Read {
            return Err(QueryError::invalid("reads are compiled with compile()"));
        }

        // Denials come first so a caller without a rule learns nothing
        // about the collection's fields.
        let permissions = self.permissions();
        let permission = permissions.effective(collection, action)?;
        if let Some(query) = query {
            Validator::new(self.catalog, self.config).validate(collection, query)?;
        }
        let root = self.collection(collection)?;

        let payload = if action.takes_payload() {
            let payload =
                payload.ok_or_else(|| QueryError::invalid(format!("{action} needs a payload")))?;
            permission.check_payload(payload)?;
            let merged = permission.apply_presets(payload);
            if let Some(validation) = &permission.validation {
                let valid = match action {
                    Action::Update => validation.matches_present(&merged),
                    _ => validation.matches(&merged),
                };
                if !valid {
                    warn!(collection, action = %action, "Payload failed validation");
                    return Err(QueryError::invalid(format!(
                        "payload does not pass the validation rules for {action} on \"{collection}\""
                    )));
                }
            }
            Some(merged)
        } else {
            None
        };

        let scope = match action {
            Action::Create => None,
            _ => Some(self.scope_plan(&permissions, root, &permission, query)?),
        };

        debug!(collection, action = %action, scoped = scope.is_some(), "Compiled mutation plan");
        Ok(MutationPlan {
            action,
            collection: collection.to_string(),
            primary_key: root.primary.clone(),
            payload,
            scope,
        })
    }

    fn collection(&self, name: &str) -> Result<&'a Collection> {
        self.catalog
            .collection(name)
            .ok_or_else(|| QueryError::invalid(format!("unknown collection \"{name}\"")))
    }

    /// Check a permission filter against the catalog; failures are
    /// deployment errors.
    fn check_scope(&self, permission: &EffectivePermission) -> Result<()> {
        let Some(filter) = &permission.filter else {
            return Ok(());
        };
        Validator::new(self.catalog, self.config)
            .filter(&permission.collection, filter, None)
            .map_err(|error| {
                warn!(collection = %permission.collection, action = %permission.action, %error, "Permission filter does not fit the schema");
                QueryError::InvalidConfig(format!(
                    "permission filter for {} on \"{}\" does not fit the schema",
                    permission.action, permission.collection
                ))
            })
    }

    /// Every caller-supplied path except `fields` must be readable.
    fn check_paths(
        &self,
        permissions: &PermissionResolver<'_>,
        permission: &EffectivePermission,
        query: &Query,
    ) -> Result<()> {
        let mut paths: Vec<&FieldPath> = Vec::new();
        if let Some(filter) = &query.filter {
            paths.extend(filter.comparisons().into_iter().map(|c| &c.path));
        }
        paths.extend(query.sort.iter().map(|s| &s.path));
        paths.extend(query.group_by.iter());
        paths.extend(
            query
                .aggregate
                .iter()
                .filter(|a| !(a.field.is_wildcard() && a.field.depth() == 0))
                .map(|a| &a.field),
        );
        paths.extend(query.alias.values());

        for path in paths {
            permissions.check_path(self.catalog, permission, path)?;
        }
        Ok(())
    }

    fn select(
        &self,
        permissions: &PermissionResolver<'_>,
        permission: &EffectivePermission,
        query: &Query,
        limit: Option<u64>,
    ) -> Result<QueryPlan> {
        let collection = permission.collection.as_str();
        let root = self.collection(collection)?;

        // 3. Field access for filter, sort, grouping and aliases.
        self.check_paths(permissions, permission, query)?;
        self.check_scope(permission)?;

        let scopes = ReadScopes {
            compiler: self,
            permissions,
        };
        let mut joins = JoinResolver::new(self.catalog, collection)?.with_scoper(&scopes);
        let mut plan = QueryPlan::new(collection, joins.root_alias(), &root.primary);

        // 4. WHERE: permission scope AND caller filter AND search.
        let mut clauses = where_clauses(&mut joins, permission, query.filter.as_ref())?;
        if let Some(term) = &query.search {
            clauses.push(search_predicate(root, joins.root_alias(), permission, term));
        }
        plan.predicate = Predicate::all(clauses);

        // 5. Projections, or group columns plus aggregates.
        let mut selections = BTreeMap::new();
        if query.is_aggregating() {
            for group in &query.group_by {
                let (operand, _) = joins.operand(group, false)?;
                plan.group_by.push(operand.clone());
                push_projection(&mut plan, operand, group.to_string(), false)?;
            }
            for aggregate in &query.aggregate {
                let operand = if aggregate.field.is_wildcard() && aggregate.field.depth() == 0 {
                    // COUNT(DISTINCT *) does not exist; count distinct keys.
                    aggregate
                        .function
                        .is_distinct()
                        .then(|| Operand::column(joins.root_alias(), &root.primary))
                } else {
                    Some(joins.operand(&aggregate.field, false)?.0)
                };
                let output = aggregate.output_path();
                if plan.projections.iter().any(|p| p.output == output) {
                    return Err(duplicate_output(&output));
                }
                plan.projections.push(Projection {
                    expr: ProjectionExpr::Aggregate {
                        function: aggregate.function,
                        operand,
                    },
                    output,
                    hidden: false,
                });
            }
        } else {
            self.project(permissions, permission, root, query, &mut joins, &mut plan, &mut selections)?;
        }

        // 6. Ordering, falling back to the collection's sort field.
        for sort in &query.sort {
            let (operand, _) = joins.operand(&sort.path, false)?;
            plan.order_by.push(OrderTerm {
                operand,
                descending: sort.descending,
            });
        }
        if query.sort.is_empty() && !query.is_aggregating() {
            if let Some(sort_field) = &root.sort_field {
                plan.order_by.push(OrderTerm {
                    operand: Operand::column(joins.root_alias(), sort_field),
                    descending: false,
                });
            }
        }

        plan.limit = limit;
        plan.offset = query.offset;

        // 7. To-many selections become nested plans.
        for (key, selection) in selections {
            let parent_key = self.parent_key(&selection, &mut plan)?;
            let nested = self.nested(permissions, selection, parent_key, query.deep.get(&key))?;
            plan.nested.push(nested);
        }

        // 8. Count queries.
        if !query.meta.is_empty() {
            let mut meta = MetaPlan::default();
            if query.meta.total_count {
                let mut count_joins = JoinResolver::new(self.catalog, collection)?;
                let predicate = match &permission.filter {
                    Some(filter) => Some(lower(&mut count_joins, filter)?),
                    None => None,
                };
                let fans_out = count_joins.fans_out();
                meta.total_count = Some(Box::new(count_plan(
                    root,
                    count_joins.into_joins(),
                    predicate,
                    fans_out,
                )));
            }
            if query.meta.filter_count {
                meta.filter_count = Some(Box::new(count_plan(
                    root,
                    joins.joins().to_vec(),
                    plan.predicate.clone(),
                    joins.fans_out(),
                )));
            }
            plan.meta = Some(meta);
        }

        // 9. Joins that multiply rows make the result DISTINCT.
        plan.distinct = joins.fans_out() && !query.is_aggregating();
        plan.joins = joins.into_joins();
        Ok(plan)
    }

    #[allow(clippy::too_many_arguments)]
    fn project(
        &self,
        permissions: &PermissionResolver<'_>,
        permission: &EffectivePermission,
        root: &Collection,
        query: &Query,
        joins: &mut JoinResolver<'_>,
        plan: &mut QueryPlan,
        selections: &mut BTreeMap<String, Selection>,
    ) -> Result<()> {
        for path in &query.fields {
            let resolved = self.catalog.walk(&root.name, path)?;
            let split = resolved
                .steps
                .iter()
                .position(|s| s.hop.is_to_many())
                .or_else(|| resolved.ends_to_many().then_some(resolved.steps.len()));

            if let Some(index) = split {
                let head = FieldPath::from_segments(path.segments()[..=index].iter().cloned());
                permissions.check_path(self.catalog, permission, &head)?;
                let (owner_alias, owner) = joins.walk(&head)?;
                let hop = self.catalog.hop(&owner.collection.name, head.last()).ok_or_else(|| {
                    QueryError::invalid(format!("\"{head}\" is not a relation"))
                })?;
                let rest = &path.segments()[index + 1..];
                let rest = (!rest.is_empty())
                    .then(|| FieldPath::from_segments(rest.iter().cloned()).with_function(path.function()));

                selections
                    .entry(head.dotted())
                    .or_insert_with(|| Selection {
                        head,
                        owner_alias,
                        hop,
                        fields: Vec::new(),
                    })
                    .fields
                    .push(rest);
                continue;
            }

            permissions.check_path(self.catalog, permission, path)?;
            if !path.is_wildcard() {
                let (operand, _) = joins.operand(path, false)?;
                push_projection(plan, operand, path.to_string(), false)?;
                continue;
            }

            // `*` expands to the allowed columns of the collection it names.
            let (alias, resolved) = joins.walk(path)?;
            let allowed: Cow<'_, EffectivePermission> = if resolved.steps.is_empty() {
                Cow::Borrowed(permission)
            } else {
                Cow::Owned(permissions.effective(&resolved.collection.name, Action::Read)?)
            };
            let prefix = path.parents().join(".");
            for name in allowed.visible_fields(resolved.collection) {
                let is_column = resolved
                    .collection
                    .field(name)
                    .map(|f| f.has_column())
                    .unwrap_or(false);
                if !is_column {
                    continue;
                }
                let output = if prefix.is_empty() {
                    name.to_string()
                } else {
                    format!("{prefix}.{name}")
                };
                push_projection(plan, Operand::column(alias.as_str(), name), output, false)?;
            }
        }

        for (name, target) in &query.alias {
            let (operand, _) = joins.operand(target, false)?;
            push_projection(plan, operand, name.clone(), false)?;
        }
        Ok(())
    }

    /// Project the key a nested plan is matched on; returns its output name.
    fn parent_key(&self, selection: &Selection, plan: &mut QueryPlan) -> Result<String> {
        let source_key = match &selection.hop {
            RelationHop::OneToMany { source_key, .. } | RelationHop::ManyToMany { source_key, .. } => {
                source_key
            }
            RelationHop::ManyToOne { .. } => {
                return Err(QueryError::invalid(format!(
                    "\"{}\" is not a to-many relation",
                    selection.head
                )))
            }
        };
        let parents = selection.head.parents();
        let output = if parents.is_empty() {
            source_key.clone()
        } else {
            format!("{}.{}", parents.join("."), source_key)
        };
        push_projection(
            plan,
            Operand::column(selection.owner_alias.as_str(), source_key.as_str()),
            output.clone(),
            true,
        )?;
        Ok(output)
    }

    fn nested(
        &self,
        permissions: &PermissionResolver<'_>,
        selection: Selection,
        parent_key: String,
        deep: Option<&DeepQuery>,
    ) -> Result<NestedPlan> {
        // Many-to-many selections are rooted at the junction and reach the
        // target through its foreign key.
        let (root_name, link_column, prefix) = match &selection.hop {
            RelationHop::OneToMany {
                target, foreign_key, ..
            } => (target, foreign_key, None),
            RelationHop::ManyToMany {
                junction,
                junction_source,
                junction_target,
                ..
            } => (junction, junction_source, Some(junction_target)),
            RelationHop::ManyToOne { .. } => {
                return Err(QueryError::invalid(format!(
                    "\"{}\" is not a to-many relation",
                    selection.head
                )))
            }
        };
        let root = self.collection(root_name)?;
        let prefix: Vec<String> = prefix.into_iter().cloned().collect();

        let mut sub = Query {
            fields: selection
                .fields
                .iter()
                .map(|field| match (field, prefix.first()) {
                    (Some(field), _) => field.prefixed(&prefix),
                    (None, Some(junction_target)) => FieldPath::from_segments([junction_target.as_str()]),
                    (None, None) => FieldPath::from_segments([root.primary.as_str()]),
                })
                .collect(),
            ..Query::default()
        };
        if let Some(deep) = deep {
            sub.filter = deep.filter.as_ref().map(|f| f.prefixed(&prefix));
            sub.sort = deep
                .sort
                .iter()
                .map(|s| SortSpec {
                    path: s.path.prefixed(&prefix),
                    descending: s.descending,
                })
                .collect();
            sub.search = deep.search.clone();
            sub.deep = deep
                .deep
                .iter()
                .map(|(key, value)| {
                    let key = match prefix.first() {
                        Some(p) => format!("{p}.{key}"),
                        None => key.clone(),
                    };
                    (key, value.clone())
                })
                .collect();
        }

        let mut plan = match permissions.lookup(&root.name, Action::Read)? {
            Some(permission) => self.select(permissions, &permission, &sub, None)?,
            None => {
                debug!(collection = %root.name, field = %selection.head, "Nested relation denied");
                let mut plan = QueryPlan::new(&root.name, &root.name, &root.primary);
                plan.predicate = Some(Predicate::Constant(false));
                plan.projections.push(Projection::column(
                    ColumnRef::new(&root.name, &root.primary),
                    root.primary.clone(),
                ));
                plan
            }
        };
        let link = ColumnRef::new(&plan.alias, link_column);
        push_projection(&mut plan, Operand::Column(link.clone()), link_column.clone(), true)?;

        Ok(NestedPlan {
            field: selection.head.dotted(),
            parent_key,
            link,
            link_output: link_column.clone(),
            per_parent_limit: deep.and_then(|d| d.limit),
            per_parent_offset: deep.and_then(|d| d.offset).unwrap_or(0),
            plan,
        })
    }

    fn scope_plan(
        &self,
        permissions: &PermissionResolver<'_>,
        root: &Collection,
        permission: &EffectivePermission,
        query: Option<&Query>,
    ) -> Result<QueryPlan> {
        self.check_scope(permission)?;
        let caller = query.and_then(|q| q.filter.clone());
        if let Some(filter) = &caller {
            for comparison in filter.comparisons() {
                // Rows can always be addressed by primary key.
                if comparison.path.depth() == 0 && comparison.path.last() == root.primary {
                    continue;
                }
                permissions.check_path(self.catalog, permission, &comparison.path)?;
            }
        }

        let scopes = ReadScopes {
            compiler: self,
            permissions,
        };
        let mut joins = JoinResolver::new(self.catalog, &root.name)?.with_scoper(&scopes);
        let mut plan = QueryPlan::new(&root.name, joins.root_alias(), &root.primary);
        plan.predicate = Predicate::all(where_clauses(&mut joins, permission, caller.as_ref())?);
        plan.projections.push(Projection::column(
            ColumnRef::new(joins.root_alias(), &root.primary),
            root.primary.clone(),
        ));
        plan.limit = query.map(|q| q.limit);
        plan.distinct = joins.fans_out();
        plan.joins = joins.into_joins();
        Ok(plan)
    }

    /// Plan selecting `key` of the `collection` rows this caller may read;
    /// `None` when every row is readable.
    fn read_scope(
        &self,
        permissions: &PermissionResolver<'_>,
        collection: &str,
        key: &str,
    ) -> Result<Option<QueryPlan>> {
        let permission = permissions
            .lookup(collection, Action::Read)?
            .unwrap_or_else(|| EffectivePermission::denied(collection, Action::Read));
        let Some(filter) = &permission.filter else {
            return Ok(None);
        };
        self.check_scope(&permission)?;

        let root = self.collection(collection)?;
        let mut joins = JoinResolver::new(self.catalog, collection)?;
        let mut plan = QueryPlan::new(collection, joins.root_alias(), &root.primary);
        plan.predicate = Some(joins.trusted(|joins| lower(joins, filter))?);
        plan.projections.push(Projection::column(ColumnRef::new(joins.root_alias(), key), key));
        plan.joins = joins.into_joins();
        Ok(Some(plan))
    }
}

/// Read scopes of the collections caller paths reach.
#[derive(Debug)]
struct ReadScopes<'c, 'a> {
    compiler: &'c Compiler<'a>,
    permissions: &'c PermissionResolver<'c>,
}

impl RowScoper for ReadScopes<'_, '_> {
    fn scope(&self, collection: &str, key: &str) -> Result<Option<QueryPlan>> {
        self.compiler.read_scope(self.permissions, collection, key)
    }
}

/// Permission scope lowered in trusted mode, then the caller filter.
fn where_clauses(
    joins: &mut JoinResolver<'_>,
    permission: &EffectivePermission,
    caller: Option<&FilterNode>,
) -> Result<Vec<Predicate>> {
    let mut clauses = Vec::new();
    if let Some(filter) = &permission.filter {
        clauses.push(joins.trusted(|joins| lower(joins, filter))?);
    }
    if let Some(filter) = caller {
        clauses.push(lower(joins, filter)?);
    }
    Ok(clauses)
}

/// Add an output column. Repeating an identical projection is a no-op; two
/// different expressions under one name are rejected.
fn push_projection(plan: &mut QueryPlan, operand: Operand, output: String, hidden: bool) -> Result<()> {
    let expr = ProjectionExpr::Operand(operand);
    if let Some(existing) = plan.projections.iter().find(|p| p.output == output) {
        if existing.expr == expr {
            return Ok(());
        }
        return Err(duplicate_output(&output));
    }
    plan.projections.push(Projection {
        expr,
        output,
        hidden,
    });
    Ok(())
}

fn duplicate_output(output: &str) -> QueryError {
    QueryError::invalid(format!("output \"{output}\" is selected twice with different values"))
}

fn count_plan(
    root: &Collection,
    joins: Vec<Join>,
    predicate: Option<Predicate>,
    fans_out: bool,
) -> QueryPlan {
    let mut plan = QueryPlan::new(&root.name, &root.name, &root.primary);
    let expr = if fans_out {
        ProjectionExpr::Aggregate {
            function: AggregateFunction::CountDistinct,
            operand: Some(Operand::column(root.name.as_str(), root.primary.as_str())),
        }
    } else {
        ProjectionExpr::Aggregate {
            function: AggregateFunction::CountAll,
            operand: None,
        }
    };
    plan.projections.push(Projection {
        expr,
        output: "count".to_string(),
        hidden: false,
    });
    plan.joins = joins;
    plan.predicate = predicate;
    plan
}

// ---------------------------------------------------------------------------
// Filter lowering
// ---------------------------------------------------------------------------

/// Lower a filter tree to a predicate, joining the relations it touches.
fn lower(joins: &mut JoinResolver<'_>, node: &FilterNode) -> Result<Predicate> {
    match node {
        FilterNode::Comparison(c) => lower_comparison(joins, c),
        FilterNode::And(children) => Ok(Predicate::And(
            children
                .iter()
                .map(|child| lower(joins, child))
                .collect::<Result<_>>()?,
        )),
        FilterNode::Or(children) => Ok(Predicate::Or(
            children
                .iter()
                .map(|child| lower(joins, child))
                .collect::<Result<_>>()?,
        )),
        FilterNode::Not(inner) => Ok(Predicate::Not(Box::new(lower(joins, inner)?))),
        FilterNode::False => Ok(Predicate::Constant(false)),
    }
}

fn lower_comparison(joins: &mut JoinResolver<'_>, c: &Comparison) -> Result<Predicate> {
    let (operand, field) = joins.operand(&c.path, true)?;
    let field_type = field.field_type;

    let value = if c.operator.is_flag() {
        c.value.clone()
    } else {
        let value_type = comparison_value_type(c.path.function(), field_type, c.operator);
        c.value.coerce(value_type).ok_or_else(|| QueryError::TypeMismatch {
            path: c.path.to_string(),
            operator: c.operator.to_string(),
            reason: format!("value {} is not a valid {value_type}", c.value),
        })?
    };
    let flag = value.as_flag().unwrap_or(true);

    let compare = |op: CompareOp, operand: Operand, value: Value| Predicate::Compare { operand, op, value };
    let predicate = match c.operator {
        Operator::Eq if value.is_null() => Predicate::IsNull {
            operand,
            negated: false,
        },
        Operator::Neq if value.is_null() => Predicate::IsNull {
            operand,
            negated: true,
        },
        Operator::Eq => compare(CompareOp::Eq, operand, value),
        Operator::Neq => compare(CompareOp::Neq, operand, value),
        Operator::Gt => compare(CompareOp::Gt, operand, value),
        Operator::Gte => compare(CompareOp::Gte, operand, value),
        Operator::Lt => compare(CompareOp::Lt, operand, value),
        Operator::Lte => compare(CompareOp::Lte, operand, value),
        Operator::In | Operator::Nin => Predicate::In {
            operand,
            values: into_list(value),
            negated: c.operator == Operator::Nin,
        },
        Operator::Between | Operator::NBetween => {
            let mut bounds = into_list(value);
            if bounds.len() != 2 {
                return Err(QueryError::invalid(format!(
                    "{} on \"{}\" needs exactly two values",
                    c.operator, c.path
                )));
            }
            let high = bounds.pop().unwrap_or(Value::Null);
            let low = bounds.pop().unwrap_or(Value::Null);
            Predicate::Between {
                operand,
                low,
                high,
                negated: c.operator == Operator::NBetween,
            }
        }
        Operator::Contains
        | Operator::NContains
        | Operator::IContains
        | Operator::StartsWith
        | Operator::NStartsWith
        | Operator::EndsWith
        | Operator::NEndsWith => {
            let text = match &value {
                Value::String(s) => escape_like(s),
                other => escape_like(&other.to_string()),
            };
            let pattern = match c.operator {
                Operator::StartsWith | Operator::NStartsWith => format!("{text}%"),
                Operator::EndsWith | Operator::NEndsWith => format!("%{text}"),
                _ => format!("%{text}%"),
            };
            Predicate::Like {
                operand,
                pattern,
                case_insensitive: c.operator == Operator::IContains,
                negated: matches!(
                    c.operator,
                    Operator::NContains | Operator::NStartsWith | Operator::NEndsWith
                ),
            }
        }
        Operator::Null | Operator::NNull => {
            let wants_null = (c.operator == Operator::Null) == flag;
            Predicate::IsNull {
                operand,
                negated: !wants_null,
            }
        }
        Operator::Empty | Operator::NEmpty => {
            let wants_empty = (c.operator == Operator::Empty) == flag;
            let mut alternatives = vec![
                Predicate::IsNull {
                    operand: operand.clone(),
                    negated: false,
                },
                compare(CompareOp::Eq, operand.clone(), Value::String(String::new())),
            ];
            if matches!(field_type, FieldType::Json | FieldType::Csv) {
                alternatives.push(compare(CompareOp::Eq, operand, Value::String("[]".to_string())));
            }
            let empty = Predicate::Or(alternatives);
            if wants_empty {
                empty
            } else {
                Predicate::Not(Box::new(empty))
            }
        }
    };
    Ok(predicate)
}

fn into_list(value: Value) -> Vec<Value> {
    match value {
        Value::List(items) => items,
        other => vec![other],
    }
}

/// Escape `LIKE` metacharacters.
fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// OR over the readable fields of the root collection: case-insensitive
/// containment on text, equality on numbers and UUIDs the term parses as.
fn search_predicate(
    root: &Collection,
    alias: &str,
    permission: &EffectivePermission,
    term: &str,
) -> Predicate {
    let text = Value::String(term.to_string());
    let mut alternatives = Vec::new();
    for field in root.fields.iter().filter(|f| permission.allows_field(&f.name)) {
        let operand = Operand::column(alias, field.name.as_str());
        match field.field_type {
            FieldType::String | FieldType::Text => alternatives.push(Predicate::Like {
                operand,
                pattern: format!("%{}%", escape_like(term)),
                case_insensitive: true,
                negated: false,
            }),
            t if t.is_numeric() || t == FieldType::Uuid => {
                if let Some(value) = text.coerce(t) {
                    alternatives.push(Predicate::Compare {
                        operand,
                        op: CompareOp::Eq,
                        value,
                    });
                }
            }
            _ => {}
        }
    }
    if alternatives.is_empty() {
        Predicate::Constant(false)
    } else {
        Predicate::Or(alternatives)
    }
}
