// SPDX-License-Identifier: PMPL-1.0-or-later
//! Share augmentation.
//!
//! A share grants read access to one item to someone who would otherwise
//! not see it. The grant is expressed as synthesized read rules: the shared
//! collection scoped to the item's primary key, plus every directly related
//! collection scoped through the relation back to the item. The rules are
//! OR-merged with the caller's own, like any other rule.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::error::{QueryError, Result};
use crate::permissions::{Action, FieldList, PermissionRule};
use crate::schema::SchemaCatalog;

/// An item explicitly shared with a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub id: String,
    pub collection: String,
    /// Primary key of the shared item.
    pub item: String,
    /// Role whose field allow-lists bound what the share exposes.
    #[serde(default)]
    pub role: Option<String>,
}

impl Share {
    pub fn new(id: impl Into<String>, collection: impl Into<String>, item: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            collection: collection.into(),
            item: item.into(),
            role: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    fn rule_role(&self) -> String {
        format!("share:{}", self.id)
    }
}

/// Read rules granted by `share`.
///
/// Without a share role every field is exposed; with one, each rule takes
/// that role's read allow-list for the collection and collections the role
/// cannot read are skipped.
pub fn share_rules(
    catalog: &SchemaCatalog,
    rules: &[PermissionRule],
    share: &Share,
) -> Result<Vec<PermissionRule>> {
    let shared = catalog.collection(&share.collection).ok_or_else(|| {
        QueryError::invalid(format!("share {} targets unknown collection \"{}\"", share.id, share.collection))
    })?;
    let item = JsonValue::String(share.item.clone());

    let mut scopes: Vec<(String, JsonValue)> = vec![(
        shared.name.clone(),
        json!({ &shared.primary: { "_eq": item } }),
    )];

    for relation in catalog.relations_of(&shared.name) {
        // The shared item points at a parent: reach the parent through its
        // reverse alias.
        if relation.many_collection == shared.name && relation.junction_field.is_none() {
            if let Some(reverse) = &relation.one_field {
                scopes.push((
                    relation.one_collection.clone(),
                    json!({ reverse: { &shared.primary: { "_eq": item } } }),
                ));
            }
        }

        if relation.one_collection != shared.name {
            continue;
        }
        // Children (or junction rows) point at the shared item.
        scopes.push((
            relation.many_collection.clone(),
            json!({ &relation.many_field: { "_eq": item } }),
        ));

        // Many-to-many targets are reached through their own reverse alias.
        let Some(junction_field) = &relation.junction_field else {
            continue;
        };
        let sibling = catalog.relations().iter().find(|r| {
            r.many_collection == relation.many_collection && &r.many_field == junction_field
        });
        if let Some(sibling) = sibling {
            if let Some(reverse) = &sibling.one_field {
                scopes.push((
                    sibling.one_collection.clone(),
                    json!({ reverse: { &shared.primary: { "_eq": item } } }),
                ));
            }
        }
    }

    let mut out = Vec::with_capacity(scopes.len());
    for (collection, filter) in scopes {
        let fields = match &share.role {
            None => FieldList::All,
            Some(role) => {
                let mut fields = FieldList::Empty;
                let mut any = false;
                for rule in rules.iter().filter(|r| {
                    &r.role == role && r.collection == collection && r.action == Action::Read
                }) {
                    any = true;
                    fields.union(&rule.fields);
                }
                if !any {
                    continue;
                }
                fields
            }
        };
        out.push(PermissionRule {
            fields,
            ..PermissionRule::new(share.rule_role(), collection, Action::Read).with_filter(filter)
        });
    }

    debug!(share = %share.id, collection = %share.collection, rules = out.len(), "Synthesized share rules");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::grants_catalog;

    fn scope_of<'r>(rules: &'r [PermissionRule], collection: &str) -> Vec<&'r JsonValue> {
        rules
            .iter()
            .filter(|r| r.collection == collection)
            .filter_map(|r| r.filter.as_ref())
            .collect()
    }

    #[test]
    fn test_shared_item_and_children() {
        let catalog = grants_catalog();
        let rules = share_rules(&catalog, &[], &Share::new("s1", "grants", "42")).unwrap();

        assert_eq!(scope_of(&rules, "grants"), vec![&json!({"id": {"_eq": "42"}})]);
        assert_eq!(
            scope_of(&rules, "applications"),
            vec![&json!({"grant_id": {"_eq": "42"}})]
        );
        // grants.organization_id has no reverse alias on yp_organizations.
        assert!(scope_of(&rules, "yp_organizations").is_empty());
        assert!(rules.iter().all(|r| r.action == Action::Read && r.role == "share:s1"));
    }

    #[test]
    fn test_parent_through_reverse_alias() {
        let catalog = grants_catalog();
        let rules = share_rules(&catalog, &[], &Share::new("s2", "applications", "7")).unwrap();
        assert_eq!(
            scope_of(&rules, "ngos"),
            vec![&json!({"applications": {"id": {"_eq": "7"}}})]
        );
        assert_eq!(
            scope_of(&rules, "grants"),
            vec![&json!({"applications": {"id": {"_eq": "7"}}})]
        );
        // Junction rows of the reviewers relation.
        assert_eq!(
            scope_of(&rules, "applications_reviewers"),
            vec![&json!({"applications_id": {"_eq": "7"}})]
        );
    }

    #[test]
    fn test_share_role_bounds_fields() {
        let catalog = grants_catalog();
        let role_rules = vec![PermissionRule::new("guest", "grants", Action::Read).with_fields(&["id", "title"])];
        let share = Share::new("s3", "grants", "1").with_role("guest");
        let rules = share_rules(&catalog, &role_rules, &share).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].fields, FieldList::from_names(["id", "title"]));
    }

    #[test]
    fn test_unknown_collection() {
        let catalog = grants_catalog();
        assert!(share_rules(&catalog, &[], &Share::new("s4", "missing", "1")).is_err());
    }
}
