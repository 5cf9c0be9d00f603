// SPDX-License-Identifier: PMPL-1.0-or-later
//! Permission rules and their per-request reduction.
//!
//! A caller's rights on `(collection, action)` are the **OR** of every rule
//! any of their roles holds for that pair:
//!
//! - row scope: OR of the rule filters; a rule without a filter makes the
//!   scope unrestricted,
//! - field allow-list: union of the rule field lists (`*` wins),
//! - presets: merged in rule order, later rules overriding earlier ones.
//!
//! The resulting [`EffectivePermission`] is then AND-ed with whatever the
//! caller asked for, so a query can only narrow its granted scope.
//! Administrators bypass all of this.

pub mod reduce;
pub mod share;

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};

use crate::accountability::Accountability;
use crate::config::CompilerConfig;
use crate::error::{QueryError, Result};
use crate::filter::variables::VariableResolver;
use crate::filter::{merge_filters, FilterNode, FilterParser, MergeStrategy};
use crate::path::FieldPath;
use crate::schema::{Collection, SchemaCatalog};

pub use reduce::reduce_schema;
pub use share::{share_rules, Share};

// ---------------------------------------------------------------------------
// Rule types
// ---------------------------------------------------------------------------

/// Operation a permission rule grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
    Share,
}

impl Action {
    pub const ALL: [Action; 5] = [
        Action::Create,
        Action::Read,
        Action::Update,
        Action::Delete,
        Action::Share,
    ];

    /// Actions that write a payload.
    pub fn takes_payload(self) -> bool {
        matches!(self, Action::Create | Action::Update)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Create => write!(f, "create"),
            Action::Read => write!(f, "read"),
            Action::Update => write!(f, "update"),
            Action::Delete => write!(f, "delete"),
            Action::Share => write!(f, "share"),
        }
    }
}

impl FromStr for Action {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "create" => Ok(Action::Create),
            "read" => Ok(Action::Read),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            "share" => Ok(Action::Share),
            other => Err(QueryError::invalid(format!("unknown action \"{other}\""))),
        }
    }
}

/// Field allow-list of a rule: `"*"` or an explicit list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawFieldList", into = "RawFieldList")]
pub enum FieldList {
    All,
    #[default]
    Empty,
    Only(BTreeSet<String>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawFieldList {
    Text(String),
    List(Vec<String>),
    Null(()),
}

impl TryFrom<RawFieldList> for FieldList {
    type Error = QueryError;

    fn try_from(raw: RawFieldList) -> Result<Self> {
        let names: Vec<String> = match raw {
            RawFieldList::Null(()) => return Ok(FieldList::Empty),
            RawFieldList::Text(s) => s.split(',').map(|f| f.trim().to_string()).collect(),
            RawFieldList::List(list) => list,
        };
        Ok(FieldList::from_names(names))
    }
}

impl From<FieldList> for RawFieldList {
    fn from(list: FieldList) -> Self {
        match list {
            FieldList::All => RawFieldList::Text("*".to_string()),
            FieldList::Empty => RawFieldList::List(Vec::new()),
            FieldList::Only(names) => RawFieldList::List(names.into_iter().collect()),
        }
    }
}

impl FieldList {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: BTreeSet<String> = names
            .into_iter()
            .map(Into::into)
            .filter(|n| !n.is_empty())
            .collect();
        if names.contains("*") {
            FieldList::All
        } else if names.is_empty() {
            FieldList::Empty
        } else {
            FieldList::Only(names)
        }
    }

    pub fn contains(&self, field: &str) -> bool {
        match self {
            FieldList::All => true,
            FieldList::Empty => false,
            FieldList::Only(names) => names.contains(field),
        }
    }

    /// Union in place; `All` absorbs everything.
    pub fn union(&mut self, other: &FieldList) {
        match other {
            FieldList::Empty => {}
            FieldList::All => *self = FieldList::All,
            FieldList::Only(extra) => match self {
                FieldList::All => {}
                FieldList::Empty => *self = FieldList::Only(extra.clone()),
                FieldList::Only(names) => names.extend(extra.iter().cloned()),
            },
        }
    }
}

/// One stored permission row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub role: String,
    pub collection: String,
    pub action: Action,
    /// Row scope, in filter syntax. Absent means every row.
    #[serde(default)]
    pub filter: Option<JsonValue>,
    /// Condition a write payload must satisfy.
    #[serde(default)]
    pub validation: Option<JsonValue>,
    /// Values forced onto write payloads.
    #[serde(default)]
    pub presets: Option<Map<String, JsonValue>>,
    #[serde(default)]
    pub fields: FieldList,
}

impl PermissionRule {
    pub fn new(role: impl Into<String>, collection: impl Into<String>, action: Action) -> Self {
        Self {
            role: role.into(),
            collection: collection.into(),
            action,
            filter: None,
            validation: None,
            presets: None,
            fields: FieldList::All,
        }
    }

    pub fn with_filter(mut self, filter: JsonValue) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_validation(mut self, validation: JsonValue) -> Self {
        self.validation = Some(validation);
        self
    }

    pub fn with_fields(mut self, fields: &[&str]) -> Self {
        self.fields = FieldList::from_names(fields.iter().copied());
        self
    }

    pub fn with_presets(mut self, presets: Map<String, JsonValue>) -> Self {
        self.presets = Some(presets);
        self
    }

    /// Parse a JSON array of rules.
    pub fn list_from_json(json: &str) -> Result<Vec<Self>> {
        serde_json::from_str(json).map_err(|e| QueryError::InvalidConfig(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Effective permission
// ---------------------------------------------------------------------------

/// Merged rights of one caller on one `(collection, action)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectivePermission {
    pub collection: String,
    pub action: Action,
    /// Row scope; `None` is unrestricted.
    pub filter: Option<FilterNode>,
    pub validation: Option<FilterNode>,
    pub fields: FieldList,
    /// Presets with dynamic variables resolved.
    pub presets: Map<String, JsonValue>,
}

impl EffectivePermission {
    /// Everything allowed, as for administrators.
    pub fn unrestricted(collection: &str, action: Action) -> Self {
        Self {
            collection: collection.to_string(),
            action,
            filter: None,
            validation: None,
            fields: FieldList::All,
            presets: Map::new(),
        }
    }

    /// No rows and no fields.
    pub fn denied(collection: &str, action: Action) -> Self {
        Self {
            filter: Some(FilterNode::False),
            fields: FieldList::Empty,
            ..Self::unrestricted(collection, action)
        }
    }

    pub fn allows_field(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    /// Expand `*`: the collection's fields the caller may see, in
    /// declaration order.
    pub fn visible_fields<'c>(&self, collection: &'c Collection) -> Vec<&'c str> {
        collection
            .fields
            .iter()
            .filter(|f| self.allows_field(&f.name))
            .map(|f| f.name.as_str())
            .collect()
    }

    /// AND the row scope with a caller filter.
    pub fn scope(&self, caller: Option<FilterNode>) -> Option<FilterNode> {
        merge_filters(self.filter.clone(), caller, MergeStrategy::And)
    }

    /// Payload with presets applied on top.
    pub fn apply_presets(&self, payload: &Map<String, JsonValue>) -> Map<String, JsonValue> {
        let mut out = payload.clone();
        for (field, value) in &self.presets {
            out.insert(field.clone(), value.clone());
        }
        out
    }

    /// Reject payload fields outside the allow-list.
    pub fn check_payload(&self, payload: &Map<String, JsonValue>) -> Result<()> {
        for field in payload.keys() {
            if !self.allows_field(field) {
                warn!(collection = %self.collection, field = %field, action = %self.action, "Payload field denied");
                return Err(QueryError::forbidden_field(self.action, &self.collection, field));
            }
        }
        Ok(())
    }
}

/// OR-merge of rule filters, independent of rule order.
///
/// Any unrestricted (`None`) scope makes the result unrestricted. Filters
/// are ordered by their canonical text and duplicates dropped before
/// wrapping, so `[A, B]` and `[B, A]` give the same tree. No scopes at all
/// yields [`FilterNode::False`].
pub fn merge_rule_filters<I>(filters: I) -> Option<FilterNode>
where
    I: IntoIterator<Item = Option<FilterNode>>,
{
    let mut scoped = Vec::new();
    let mut any = false;
    for filter in filters {
        any = true;
        match filter {
            None => return None,
            Some(f) => scoped.push(f),
        }
    }
    if !any {
        return Some(FilterNode::False);
    }

    let mut keyed: Vec<(String, FilterNode)> =
        scoped.into_iter().map(|f| (f.canonical_key(), f)).collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.dedup_by(|a, b| a.0 == b.0);

    let mut nodes: Vec<FilterNode> = keyed.into_iter().map(|(_, f)| f).collect();
    if nodes.len() == 1 {
        nodes.pop()
    } else {
        Some(FilterNode::Or(nodes))
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Resolves effective permissions for one caller.
#[derive(Debug, Clone)]
pub struct PermissionResolver<'a> {
    rules: &'a [PermissionRule],
    /// Rules synthesized for shares; they apply regardless of role.
    shared: Cow<'a, [PermissionRule]>,
    accountability: &'a Accountability,
    config: &'a CompilerConfig,
    now: DateTime<Utc>,
}

impl<'a> PermissionResolver<'a> {
    pub fn new(
        rules: &'a [PermissionRule],
        accountability: &'a Accountability,
        config: &'a CompilerConfig,
    ) -> Self {
        Self {
            rules,
            shared: Cow::Borrowed(&[]),
            accountability,
            config,
            now: Utc::now(),
        }
    }

    /// Pin the instant `$NOW` resolves to.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Add rules granted through a share.
    pub fn with_shared(mut self, rules: Vec<PermissionRule>) -> Self {
        self.shared.to_mut().extend(rules);
        self
    }

    pub fn accountability(&self) -> &'a Accountability {
        self.accountability
    }

    pub fn is_admin(&self) -> bool {
        self.accountability.admin
    }

    /// Rules of the caller for `(collection, action)`, in store order.
    pub fn matching_rules(&self, collection: &str, action: Action) -> Vec<&PermissionRule> {
        self.rules
            .iter()
            .filter(|r| self.accountability.has_role(&r.role))
            .chain(self.shared.iter())
            .filter(|r| r.collection == collection && r.action == action)
            .collect()
    }

    /// Effective permission, or `None` when the caller holds no rule.
    pub fn lookup(&self, collection: &str, action: Action) -> Result<Option<EffectivePermission>> {
        if self.is_admin() {
            return Ok(Some(EffectivePermission::unrestricted(collection, action)));
        }
        let rules = self.matching_rules(collection, action);
        if rules.is_empty() {
            return Ok(None);
        }

        let parser = FilterParser::new(self.resolver(), self.config).trusted();
        let mut filters = Vec::with_capacity(rules.len());
        let mut validations = Vec::new();
        let mut fields = FieldList::Empty;
        let mut presets = Map::new();

        for rule in &rules {
            let filter = match &rule.filter {
                Some(raw) => parser.parse(raw).map_err(|e| rule_error(rule, e))?,
                None => None,
            };
            filters.push(filter);
            if let Some(raw) = &rule.validation {
                validations.push(parser.parse(raw).map_err(|e| rule_error(rule, e))?);
            }
            fields.union(&rule.fields);
            for (field, value) in rule.presets.iter().flatten() {
                let resolved = self.resolver().resolve(value).map_err(|e| rule_error(rule, e))?;
                presets.insert(field.clone(), resolved.to_json());
            }
        }

        let effective = EffectivePermission {
            collection: collection.to_string(),
            action,
            filter: merge_rule_filters(filters),
            validation: if validations.is_empty() {
                None
            } else {
                merge_rule_filters(validations)
            },
            fields,
            presets,
        };
        debug!(
            collection,
            action = %action,
            rules = rules.len(),
            restricted = effective.filter.is_some(),
            "Resolved effective permission"
        );
        Ok(Some(effective))
    }

    /// Effective permission; `Forbidden` when the caller holds no rule.
    pub fn effective(&self, collection: &str, action: Action) -> Result<EffectivePermission> {
        self.lookup(collection, action)?.ok_or_else(|| {
            warn!(collection, action = %action, roles = ?self.accountability.roles, "No permission rule");
            QueryError::forbidden_collection(action, collection)
        })
    }

    /// Check every segment of `path` against the allow-lists it touches:
    /// `root` for the first segment, the related collection's read
    /// permission for segments reached through relations.
    pub fn check_path(
        &self,
        catalog: &SchemaCatalog,
        root: &EffectivePermission,
        path: &FieldPath,
    ) -> Result<()> {
        if self.is_admin() {
            return Ok(());
        }
        let resolved = catalog.walk(&root.collection, path)?;

        let mut current = Cow::Borrowed(root);
        for step in &resolved.steps {
            if !current.allows_field(&step.field) {
                return Err(self.deny_field(&current, &step.field));
            }
            current = Cow::Owned(self.effective(step.hop.target(), Action::Read)?);
        }
        match resolved.field {
            Some(field) if !current.allows_field(&field.name) => {
                Err(self.deny_field(&current, &field.name))
            }
            _ => Ok(()),
        }
    }

    fn deny_field(&self, permission: &EffectivePermission, field: &str) -> QueryError {
        warn!(
            collection = %permission.collection,
            field,
            action = %permission.action,
            "Field denied"
        );
        QueryError::forbidden_field(permission.action, &permission.collection, field)
    }

    fn resolver(&self) -> VariableResolver<'a> {
        VariableResolver::new(self.accountability, self.now)
    }
}

/// Rule parse failures are configuration errors; the message names the
/// rule but never its contents.
fn rule_error(rule: &PermissionRule, error: QueryError) -> QueryError {
    warn!(role = %rule.role, collection = %rule.collection, action = %rule.action, %error, "Invalid permission rule");
    QueryError::InvalidConfig(format!(
        "permission rule of role \"{}\" for {} on \"{}\" is invalid",
        rule.role, rule.action, rule.collection
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Operator;
    use crate::fixtures::{grants_catalog, REVIEWER_ID};
    use crate::value::Value;
    use serde_json::json;

    fn org_rule(org: &str) -> PermissionRule {
        PermissionRule::new("R", "ngos", Action::Read)
            .with_filter(json!({"organization_id": {"_eq": org}}))
            .with_fields(&["id", "name"])
    }

    #[test]
    fn test_action_parse_display() {
        for action in Action::ALL {
            assert_eq!(action.to_string().parse::<Action>().unwrap(), action);
        }
        assert!("purge".parse::<Action>().is_err());
    }

    #[test]
    fn test_field_list_serde() {
        let all: FieldList = serde_json::from_value(json!("*")).unwrap();
        assert_eq!(all, FieldList::All);
        let some: FieldList = serde_json::from_value(json!(["id", "name"])).unwrap();
        assert!(some.contains("id") && !some.contains("budget"));
        let csv: FieldList = serde_json::from_value(json!("id,*")).unwrap();
        assert_eq!(csv, FieldList::All);
        let none: FieldList = serde_json::from_value(json!(null)).unwrap();
        assert_eq!(none, FieldList::Empty);
    }

    #[test]
    fn test_field_list_union() {
        let mut a = FieldList::from_names(["id"]);
        a.union(&FieldList::from_names(["name"]));
        assert!(a.contains("id") && a.contains("name"));
        a.union(&FieldList::All);
        assert_eq!(a, FieldList::All);
    }

    #[test]
    fn test_or_merged_permissions() {
        let rules = vec![org_rule("X"), org_rule("Y")];
        let acc = Accountability::new(None, &["R"]);
        let config = CompilerConfig::default();
        let resolver = PermissionResolver::new(&rules, &acc, &config);
        let effective = resolver.effective("ngos", Action::Read).unwrap();

        let x = FilterNode::compare("organization_id", Operator::Eq, Value::String("X".into())).unwrap();
        let y = FilterNode::compare("organization_id", Operator::Eq, Value::String("Y".into())).unwrap();
        assert_eq!(effective.filter, Some(FilterNode::Or(vec![x, y])));
    }

    #[test]
    fn test_merge_is_order_independent() {
        let acc = Accountability::new(None, &["R"]);
        let config = CompilerConfig::default();
        let ab = vec![org_rule("A"), org_rule("B")];
        let ba = vec![org_rule("B"), org_rule("A")];
        let left = PermissionResolver::new(&ab, &acc, &config).effective("ngos", Action::Read).unwrap();
        let right = PermissionResolver::new(&ba, &acc, &config).effective("ngos", Action::Read).unwrap();
        assert_eq!(left.filter, right.filter);
        assert_eq!(left.fields, right.fields);
    }

    #[test]
    fn test_unfiltered_rule_wins() {
        let rules = vec![
            org_rule("X"),
            PermissionRule::new("R", "ngos", Action::Read).with_fields(&["status"]),
        ];
        let acc = Accountability::new(None, &["R"]);
        let config = CompilerConfig::default();
        let effective = PermissionResolver::new(&rules, &acc, &config)
            .effective("ngos", Action::Read)
            .unwrap();
        assert_eq!(effective.filter, None);
        assert_eq!(effective.fields, FieldList::from_names(["id", "name", "status"]));
    }

    #[test]
    fn test_no_rule_is_forbidden() {
        let rules = vec![org_rule("X")];
        let acc = Accountability::new(None, &["R"]);
        let config = CompilerConfig::default();
        let err = PermissionResolver::new(&rules, &acc, &config)
            .effective("grants", Action::Delete)
            .unwrap_err();
        assert_eq!(err.kind(), "FORBIDDEN");
        assert_eq!(err.to_string(), "you don't have permission to delete collection \"grants\"");
    }

    #[test]
    fn test_other_roles_ignored() {
        let rules = vec![org_rule("X")];
        let acc = Accountability::new(None, &["someone_else"]);
        let config = CompilerConfig::default();
        let resolver = PermissionResolver::new(&rules, &acc, &config);
        assert_eq!(resolver.lookup("ngos", Action::Read).unwrap(), None);
    }

    #[test]
    fn test_admin_bypass() {
        let acc = Accountability::admin();
        let config = CompilerConfig::default();
        let effective = PermissionResolver::new(&[], &acc, &config)
            .effective("grants", Action::Delete)
            .unwrap();
        assert_eq!(effective, EffectivePermission::unrestricted("grants", Action::Delete));
    }

    #[test]
    fn test_presets_resolve_variables_and_override() {
        let rules = vec![
            PermissionRule::new("R", "applications", Action::Create)
                .with_presets(json!({"status": "draft", "user_created": "$CURRENT_USER"}).as_object().unwrap().clone()),
            PermissionRule::new("R", "applications", Action::Create)
                .with_presets(json!({"status": "submitted"}).as_object().unwrap().clone()),
        ];
        let acc = Accountability::new(Some(REVIEWER_ID), &["R"]);
        let config = CompilerConfig::default();
        let effective = PermissionResolver::new(&rules, &acc, &config)
            .effective("applications", Action::Create)
            .unwrap();
        let payload = json!({"status": "approved", "title": "t"});
        let applied = effective.apply_presets(payload.as_object().unwrap());
        assert_eq!(applied["status"], json!("submitted"));
        assert_eq!(applied["user_created"], json!(REVIEWER_ID));
        assert_eq!(applied["title"], json!("t"));
    }

    #[test]
    fn test_check_path_through_relations() {
        let catalog = grants_catalog();
        let rules = vec![
            PermissionRule::new("R", "applications", Action::Read).with_fields(&["id", "ngo_id"]),
            PermissionRule::new("R", "ngos", Action::Read).with_fields(&["id", "name"]),
        ];
        let acc = Accountability::new(None, &["R"]);
        let config = CompilerConfig::default();
        let resolver = PermissionResolver::new(&rules, &acc, &config);
        let root = resolver.effective("applications", Action::Read).unwrap();

        let ok = FieldPath::parse("ngo_id.name").unwrap();
        assert!(resolver.check_path(&catalog, &root, &ok).is_ok());

        let hidden = FieldPath::parse("ngo_id.organization_id").unwrap();
        let err = resolver.check_path(&catalog, &root, &hidden).unwrap_err();
        assert_eq!(
            err,
            QueryError::forbidden_field(Action::Read, "ngos", "organization_id")
        );

        let no_rule = FieldPath::parse("ngo_id.organization_id.name").unwrap();
        let rules_without_ngos = &rules[..1];
        let resolver = PermissionResolver::new(rules_without_ngos, &acc, &config);
        assert!(matches!(
            resolver.check_path(&catalog, &root, &no_rule),
            Err(QueryError::Forbidden { .. })
        ));
    }

    #[test]
    fn test_invalid_rule_does_not_leak_filter() {
        let rules = vec![PermissionRule::new("R", "ngos", Action::Read)
            .with_filter(json!({"secret_column": {"_like": "classified"}}))];
        let acc = Accountability::new(None, &["R"]);
        let config = CompilerConfig::default();
        let err = PermissionResolver::new(&rules, &acc, &config)
            .effective("ngos", Action::Read)
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidConfig(_)));
        assert!(!err.to_string().contains("classified"));
    }

    #[test]
    fn test_shared_rules_apply_without_role() {
        let acc = Accountability::new(None, &[]);
        let config = CompilerConfig::default();
        let shared = vec![PermissionRule::new("share", "grants", Action::Read)
            .with_filter(json!({"id": {"_eq": 7}}))];
        let resolver = PermissionResolver::new(&[], &acc, &config).with_shared(shared);
        assert!(resolver.effective("grants", Action::Read).is_ok());
        assert!(resolver.effective("ngos", Action::Read).is_err());
    }

    #[test]
    fn test_merge_rule_filters_edges() {
        assert_eq!(merge_rule_filters(Vec::new()), Some(FilterNode::False));
        let f = FilterNode::compare("a", Operator::Eq, Value::Int(1)).unwrap();
        assert_eq!(merge_rule_filters(vec![Some(f.clone()), Some(f.clone())]), Some(f));
    }
}
