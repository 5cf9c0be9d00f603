// SPDX-License-Identifier: PMPL-1.0-or-later
//! Shared test fixtures: a small grants-management schema and its roles.

use crate::permissions::PermissionRule;
use crate::schema::SchemaCatalog;

/// User id of the reviewer used across tests.
pub const REVIEWER_ID: &str = "6f1c2a7e-3b4d-4e5f-8a9b-0c1d2e3f4a5b";

/// Organization the NGO administrator belongs to.
pub const ORG_ID: &str = "org-123";

pub fn grants_catalog() -> SchemaCatalog {
    SchemaCatalog::from_json(include_str!("../tests/fixtures/grants_schema.json"))
        .expect("grants schema fixture is valid")
}

pub fn grants_rules() -> Vec<PermissionRule> {
    PermissionRule::list_from_json(include_str!("../tests/fixtures/grants_permissions.json"))
        .expect("grants permissions fixture is valid")
}
