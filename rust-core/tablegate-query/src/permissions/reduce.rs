// SPDX-License-Identifier: PMPL-1.0-or-later
//! Schema reduction: the catalog as one caller is allowed to see it.
//!
//! Used by introspection callers (schema endpoints, GraphQL generation).
//! Collections without a rule for any of the requested actions disappear,
//! fields shrink to the union allow-list (primary keys always stay) and
//! relations survive only while both sides and their columns do. Dropping a
//! relation can orphan an alias field, which can in turn matter to another
//! relation, so the pass repeats until nothing changes.

use std::collections::BTreeMap;

use tracing::debug;

use crate::accountability::Accountability;
use crate::error::Result;
use crate::permissions::{Action, FieldList, PermissionRule};
use crate::schema::{Collection, Field, Relation, SchemaCatalog};

/// Strip `catalog` down to what `accountability` may use for `actions`.
pub fn reduce_schema(
    catalog: &SchemaCatalog,
    rules: &[PermissionRule],
    accountability: &Accountability,
    actions: &[Action],
) -> Result<SchemaCatalog> {
    if accountability.admin {
        return Ok(catalog.clone());
    }

    let mut allowed: BTreeMap<&str, FieldList> = BTreeMap::new();
    for rule in rules {
        if accountability.has_role(&rule.role) && actions.contains(&rule.action) {
            allowed
                .entry(rule.collection.as_str())
                .or_default()
                .union(&rule.fields);
        }
    }

    let mut collections: Vec<Collection> = catalog
        .collections()
        .filter_map(|collection| {
            let fields = allowed.get(collection.name.as_str())?;
            let kept: Vec<Field> = collection
                .fields
                .iter()
                .filter(|f| f.name == collection.primary || fields.contains(&f.name))
                .cloned()
                .collect();
            Some(Collection {
                fields: kept,
                ..collection.clone()
            })
        })
        .collect();
    let mut relations: Vec<Relation> = catalog.relations().to_vec();

    let mut pass = 0;
    loop {
        pass += 1;
        let fields_before: usize = collections.iter().map(|c| c.fields.len()).sum();
        let relations_before = relations.clone();

        relations = surviving_relations(&collections, &relations);
        drop_orphan_aliases(&mut collections, &relations);

        let fields_after: usize = collections.iter().map(|c| c.fields.len()).sum();
        if fields_after == fields_before && relations == relations_before {
            break;
        }
    }

    for collection in collections.iter_mut() {
        let dropped = collection
            .sort_field
            .as_deref()
            .is_some_and(|sort| collection.field(sort).is_none());
        if dropped {
            collection.sort_field = None;
        }
    }

    debug!(
        collections = collections.len(),
        relations = relations.len(),
        passes = pass,
        "Reduced schema"
    );
    SchemaCatalog::new(collections, relations)
}

fn has_column(collections: &[Collection], collection: &str, field: &str) -> bool {
    collections
        .iter()
        .find(|c| c.name == collection)
        .and_then(|c| c.field(field))
        .map(Field::has_column)
        .unwrap_or(false)
}

fn has_alias(collections: &[Collection], collection: &str, field: &str) -> bool {
    collections
        .iter()
        .find(|c| c.name == collection)
        .and_then(|c| c.field(field))
        .map(|f| !f.has_column())
        .unwrap_or(false)
}

fn surviving_relations(collections: &[Collection], relations: &[Relation]) -> Vec<Relation> {
    let alive = |r: &Relation| {
        has_column(collections, &r.many_collection, &r.many_field)
            && collections.iter().any(|c| c.name == r.one_collection)
    };

    relations
        .iter()
        .filter(|r| alive(r))
        .filter(|r| match &r.junction_field {
            // Both halves of a junction pair must survive together.
            Some(junction_field) => relations.iter().any(|sibling| {
                sibling.many_collection == r.many_collection
                    && &sibling.many_field == junction_field
                    && alive(sibling)
            }),
            None => true,
        })
        .map(|r| {
            let mut r = r.clone();
            if let Some(alias) = &r.one_field {
                if !has_alias(collections, &r.one_collection, alias) {
                    r.one_field = None;
                }
            }
            r
        })
        .collect()
}

fn drop_orphan_aliases(collections: &mut [Collection], relations: &[Relation]) {
    for collection in collections.iter_mut() {
        let name = collection.name.clone();
        collection.fields.retain(|f| {
            f.has_column()
                || relations.iter().any(|r| {
                    r.one_collection == name && r.one_field.as_deref() == Some(f.name.as_str())
                })
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{grants_catalog, grants_rules};

    fn names(catalog: &SchemaCatalog) -> Vec<&str> {
        catalog.collections().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn test_admin_keeps_everything() {
        let catalog = grants_catalog();
        let reduced = reduce_schema(&catalog, &[], &Accountability::admin(), &[Action::Read]).unwrap();
        assert_eq!(reduced, catalog);
    }

    #[test]
    fn test_reviewer_read_schema() {
        let catalog = grants_catalog();
        let rules = grants_rules();
        let acc = Accountability::new(None, &["reviewer"]);
        let reduced = reduce_schema(&catalog, &rules, &acc, &[Action::Read]).unwrap();

        assert_eq!(names(&reduced), vec!["applications", "grants", "ngos", "users"]);

        let grants = reduced.collection("grants").unwrap();
        assert!(grants.field("budget").is_none());
        assert!(grants.field("title").is_some());

        // ngos.organization_id stays as a column, but its relation to the
        // unreadable yp_organizations is gone.
        assert!(reduced.hop("ngos", "organization_id").is_none());
        assert!(reduced.collection("ngos").unwrap().field("organization_id").is_some());

        // The junction collection is unreadable, so reviewers disappears.
        let apps = reduced.collection("applications").unwrap();
        assert!(apps.field("reviewers").is_none());
        assert!(reduced.hop("applications", "ngo_id").is_some());
    }

    #[test]
    fn test_primary_key_always_kept() {
        let catalog = grants_catalog();
        let rules = vec![PermissionRule::new("R", "grants", Action::Read).with_fields(&["title"])];
        let acc = Accountability::new(None, &["R"]);
        let reduced = reduce_schema(&catalog, &rules, &acc, &[Action::Read]).unwrap();
        let grants = reduced.collection("grants").unwrap();
        let fields: Vec<&str> = grants.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(fields, vec!["id", "title"]);
    }

    #[test]
    fn test_hidden_sort_field_is_cleared() {
        let catalog = grants_catalog();
        let rules = vec![PermissionRule::new("R", "ngos", Action::Read).with_fields(&["id", "status"])];
        let acc = Accountability::new(None, &["R"]);
        let reduced = reduce_schema(&catalog, &rules, &acc, &[Action::Read]).unwrap();
        let ngos = reduced.collection("ngos").unwrap();
        assert!(ngos.field("name").is_none());
        assert_eq!(ngos.sort_field, None);
    }

    #[test]
    fn test_visible_sort_field_is_kept() {
        let catalog = grants_catalog();
        let rules = vec![PermissionRule::new("R", "ngos", Action::Read).with_fields(&["name"])];
        let acc = Accountability::new(None, &["R"]);
        let reduced = reduce_schema(&catalog, &rules, &acc, &[Action::Read]).unwrap();
        assert_eq!(reduced.collection("ngos").unwrap().sort_field.as_deref(), Some("name"));
    }

    #[test]
    fn test_reduction_is_stable() {
        let catalog = grants_catalog();
        let rules = grants_rules();
        let acc = Accountability::new(None, &["ngo_admin"]);
        let once = reduce_schema(&catalog, &rules, &acc, &[Action::Read]).unwrap();
        let twice = reduce_schema(&once, &rules, &acc, &[Action::Read]).unwrap();
        assert_eq!(once, twice);
    }
}
