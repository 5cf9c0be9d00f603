// SPDX-License-Identifier: PMPL-1.0-or-later
//! Relation resolution and alias allocation.
//!
//! Every dot-path used by one compilation is walked through a single
//! [`JoinResolver`]. Joins are keyed by `(parent alias, relation field)` in
//! the request's [`AliasMap`], so a filter and a sort on the same relation
//! share one joined table instance.
//!
//! Paths supplied by the caller only see related rows their read permission
//! covers: with a [`RowScoper`] attached, every related table they reach is
//! restricted by a [`RowScope`]. Permission filters are resolved in
//! [`JoinResolver::trusted`] mode instead, on joins of their own that are
//! never scoped and never shared with caller paths.

use std::collections::{HashMap, HashSet};
use std::fmt;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{QueryError, Result};
use crate::path::{FieldFunction, FieldPath};
use crate::plan::{ColumnRef, Join, JoinKind, Operand, QueryPlan, RowScope};
use crate::schema::{Collection, Field, RelationHop, ResolvedPath, SchemaCatalog};

const ALIAS_LEN: usize = 8;

/// Request-scoped `(parent alias, relation field) -> alias` map.
///
/// Trusted joins live in a namespace of their own.
#[derive(Debug, Clone, Default)]
pub struct AliasMap {
    aliases: HashMap<(String, String, bool), String>,
    taken: HashSet<String>,
}

impl AliasMap {
    /// A map whose root alias is already reserved.
    pub fn new(root_alias: &str) -> Self {
        let mut map = Self::default();
        map.taken.insert(root_alias.to_string());
        map
    }

    pub fn get(&self, parent: &str, field: &str) -> Option<&str> {
        self.lookup(parent, field, false)
    }

    fn lookup(&self, parent: &str, field: &str, trusted: bool) -> Option<&str> {
        self.aliases
            .get(&(parent.to_string(), field.to_string(), trusted))
            .map(String::as_str)
    }

    /// Alias for `(parent, field)` and whether it was newly allocated.
    pub fn allocate(&mut self, parent: &str, field: &str) -> (String, bool) {
        self.allocate_in(parent, field, false)
    }

    fn allocate_in(&mut self, parent: &str, field: &str, trusted: bool) -> (String, bool) {
        if let Some(existing) = self.lookup(parent, field, trusted) {
            return (existing.to_string(), false);
        }

        let base = derive_alias(parent, field);
        let mut alias = base.clone();
        let mut suffix = 1;
        while self.taken.contains(&alias) {
            suffix += 1;
            alias = format!("{base}_{suffix}");
        }
        self.taken.insert(alias.clone());
        self.aliases
            .insert((parent.to_string(), field.to_string(), trusted), alias.clone());
        (alias, true)
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

/// Truncated SHA-256 of `parent.field`.
fn derive_alias(parent: &str, field: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent.as_bytes());
    hasher.update(b".");
    hasher.update(field.as_bytes());
    let hex: String = hasher
        .finalize()
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect();
    hex[..ALIAS_LEN].to_string()
}

/// Read scopes of related collections, supplied by the compiler.
pub trait RowScoper: fmt::Debug {
    /// Plan selecting `key` of the `collection` rows the caller may read,
    /// or `None` when every row is readable.
    fn scope(&self, collection: &str, key: &str) -> Result<Option<QueryPlan>>;
}

/// Terminal column of a resolved path.
#[derive(Debug, Clone)]
pub struct ResolvedColumn<'a> {
    pub column: ColumnRef,
    pub collection: &'a Collection,
    pub field: &'a Field,
}

/// Turns dot-paths into joins for one root collection.
#[derive(Debug, Clone)]
pub struct JoinResolver<'a> {
    catalog: &'a SchemaCatalog,
    root: &'a Collection,
    aliases: AliasMap,
    joins: Vec<Join>,
    scoper: Option<&'a dyn RowScoper>,
    trusted: bool,
}

impl<'a> JoinResolver<'a> {
    pub fn new(catalog: &'a SchemaCatalog, collection: &str) -> Result<Self> {
        let root = catalog
            .collection(collection)
            .ok_or_else(|| QueryError::invalid(format!("unknown collection \"{collection}\"")))?;
        Ok(Self {
            catalog,
            root,
            aliases: AliasMap::new(&root.name),
            joins: Vec::new(),
            scoper: None,
            trusted: false,
        })
    }

    /// Scope related tables reached outside trusted mode.
    pub fn with_scoper(mut self, scoper: &'a dyn RowScoper) -> Self {
        self.scoper = Some(scoper);
        self
    }

    /// Run `f` in trusted mode, for permission filters.
    pub fn trusted<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let previous = std::mem::replace(&mut self.trusted, true);
        let out = f(self);
        self.trusted = previous;
        out
    }

    /// The root alias is the collection name itself.
    pub fn root_alias(&self) -> &str {
        &self.root.name
    }

    pub fn root(&self) -> &'a Collection {
        self.root
    }

    pub fn joins(&self) -> &[Join] {
        &self.joins
    }

    pub fn into_joins(self) -> Vec<Join> {
        self.joins
    }

    /// Whether any join can multiply root rows.
    pub fn fans_out(&self) -> bool {
        self.joins.iter().any(|j| j.fans_out)
    }

    /// Join every hop before the terminal segment of `path`.
    ///
    /// Returns the alias owning the terminal segment together with the
    /// resolved path.
    pub fn walk(&mut self, path: &FieldPath) -> Result<(String, ResolvedPath<'a>)> {
        let resolved = self.catalog.walk(&self.root.name, path)?;
        let mut alias = self.root.name.clone();
        let mut prefix: Vec<&str> = Vec::with_capacity(resolved.steps.len());
        for step in &resolved.steps {
            prefix.push(&step.field);
            alias = self.follow(&alias, &step.field, &step.hop, &prefix.join("."))?;
        }
        Ok((alias, resolved))
    }

    /// Resolve a path that must end on a column.
    pub fn column(&mut self, path: &FieldPath) -> Result<ResolvedColumn<'a>> {
        let (alias, resolved) = self.walk(path)?;
        let field = resolved
            .field
            .ok_or_else(|| QueryError::invalid(format!("\"{path}\" does not name a column")))?;
        if !field.has_column() {
            return Err(QueryError::invalid(format!("\"{path}\" is a to-many relation")));
        }
        Ok(ResolvedColumn {
            column: ColumnRef::new(alias, &field.name),
            collection: resolved.collection,
            field,
        })
    }

    /// Operand for `path` with its function applied.
    ///
    /// With `join_terminal`, a path ending on a many-to-one foreign key also
    /// joins the key's target so later paths through the same relation reuse
    /// it; the operand still targets the foreign-key column. Trusted joins
    /// are never reused, so trusted mode skips that join.
    pub fn operand(&mut self, path: &FieldPath, join_terminal: bool) -> Result<(Operand, &'a Field)> {
        let (alias, resolved) = self.walk(path)?;
        let field = resolved
            .field
            .ok_or_else(|| QueryError::invalid(format!("\"{path}\" does not name a column")))?;

        if join_terminal && !self.trusted && path.function().is_none() {
            if let Some(hop) = self.catalog.hop(&resolved.collection.name, &field.name) {
                if !hop.is_to_many() {
                    self.follow(&alias, &field.name, &hop, &path.dotted())?;
                }
            }
        }

        let operand = match (path.function(), field.has_column()) {
            (Some(FieldFunction::Count), false) => {
                self.related_count(&alias, resolved.collection, &field.name)?
            }
            (_, false) => {
                return Err(QueryError::invalid(format!(
                    "\"{path}\" is a to-many relation"
                )))
            }
            (Some(function), true) => Operand::Function {
                function,
                column: ColumnRef::new(alias, &field.name),
                field_type: field.field_type,
            },
            (None, true) => Operand::Column(ColumnRef::new(alias, &field.name)),
        };
        Ok((operand, field))
    }

    fn related_count(&mut self, parent: &str, collection: &Collection, field: &str) -> Result<Operand> {
        let hop = self.catalog.hop(&collection.name, field).ok_or_else(|| {
            QueryError::invalid(format!("\"{field}\" is not a relation of \"{}\"", collection.name))
        })?;
        // Junction rows count as their target: `(scoped collection,
        // column of the counted table, key in the scoped collection)`.
        let (table, foreign_key, source_key, scoped) = match hop {
            RelationHop::OneToMany {
                source_key,
                target,
                foreign_key,
            } => {
                let key = self.primary_key(&target)?;
                (target.clone(), foreign_key, source_key, (target, key.clone(), key))
            }
            RelationHop::ManyToMany {
                source_key,
                junction,
                junction_source,
                junction_target,
                target,
                target_key,
            } => (
                junction,
                junction_source,
                source_key,
                (target, junction_target, target_key),
            ),
            RelationHop::ManyToOne { .. } => {
                return Err(QueryError::invalid(format!(
                    "count() on \"{field}\" needs a to-many relation"
                )))
            }
        };
        let (alias, _) = self
            .aliases
            .allocate_in(parent, &format!("count({field})"), self.trusted);
        let (collection, column, key) = scoped;
        let scope = self.row_scope(&collection, &column, &key)?;
        Ok(Operand::RelatedCount {
            table,
            alias,
            foreign_key,
            parent: ColumnRef::new(parent, source_key),
            scope,
        })
    }

    fn primary_key(&self, collection: &str) -> Result<String> {
        self.catalog
            .collection(collection)
            .map(|c| c.primary.clone())
            .ok_or_else(|| QueryError::invalid(format!("unknown collection \"{collection}\"")))
    }

    /// Scope for `collection` reached outside trusted mode, matched on
    /// `column` of the joined or counted table.
    fn row_scope(&self, collection: &str, column: &str, key: &str) -> Result<Option<RowScope>> {
        let Some(scoper) = self.scoper.filter(|_| !self.trusted) else {
            return Ok(None);
        };
        Ok(scoper
            .scope(collection, key)?
            .map(|plan| RowScope::new(column, plan)))
    }

    fn follow(&mut self, parent: &str, field: &str, hop: &RelationHop, path: &str) -> Result<String> {
        match hop {
            RelationHop::ManyToOne {
                foreign_key,
                target,
                target_key,
            } => {
                let (alias, fresh) = self.join(parent, field, target, target_key, foreign_key, false, path);
                if fresh {
                    self.scope_join(&alias, target, target_key, target_key)?;
                }
                Ok(alias)
            }
            RelationHop::OneToMany {
                source_key,
                target,
                foreign_key,
            } => {
                let (alias, fresh) = self.join(parent, field, target, foreign_key, source_key, true, path);
                if fresh {
                    let key = self.primary_key(target)?;
                    self.scope_join(&alias, target, &key, &key)?;
                }
                Ok(alias)
            }
            RelationHop::ManyToMany {
                source_key,
                junction,
                junction_source,
                junction_target,
                target,
                target_key,
            } => {
                let (junction_alias, _) =
                    self.join(parent, field, junction, junction_source, source_key, true, path);
                let (alias, fresh) = self.join(
                    &junction_alias,
                    junction_target,
                    target,
                    target_key,
                    junction_target,
                    false,
                    &format!("{path}.{junction_target}"),
                );
                if fresh {
                    self.scope_join(&alias, target, target_key, target_key)?;
                }
                Ok(alias)
            }
        }
    }

    fn scope_join(&mut self, alias: &str, collection: &str, column: &str, key: &str) -> Result<()> {
        let Some(scope) = self.row_scope(collection, column, key)? else {
            return Ok(());
        };
        if let Some(join) = self.joins.iter_mut().find(|j| j.alias == alias) {
            debug!(table = %join.table, alias, "Scoped related rows");
            join.scope = Some(scope);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn join(
        &mut self,
        parent: &str,
        field: &str,
        table: &str,
        left_column: &str,
        right_column: &str,
        fans_out: bool,
        path: &str,
    ) -> (String, bool) {
        let (alias, fresh) = self.aliases.allocate_in(parent, field, self.trusted);
        if fresh {
            debug!(table, alias = %alias, path, "Joined relation");
            self.joins.push(Join {
                kind: JoinKind::Left,
                table: table.to_string(),
                alias: alias.clone(),
                left: ColumnRef::new(&alias, left_column),
                right: ColumnRef::new(parent, right_column),
                fans_out,
                path: path.to_string(),
                scope: None,
            });
        }
        (alias, fresh)
    }
}
