// SPDX-License-Identifier: PMPL-1.0-or-later
//! Caller identity as seen by the query pipeline.
//!
//! Supplied by the authentication collaborator. The pipeline only reads it:
//! dynamic filter variables are resolved from it once, at parse time.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// The caller's authenticated identity, roles and contextual claims.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Accountability {
    /// User primary key, `None` for anonymous/public access.
    #[serde(default)]
    pub user: Option<String>,
    /// Role identifiers, most specific first.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Unrestricted administrator: permission rules are bypassed.
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub ip: Option<String>,
    /// User record fields available as `$CURRENT_USER.<path>`.
    #[serde(default)]
    pub user_attributes: Map<String, JsonValue>,
    /// Role record fields available as `$CURRENT_ROLE.<path>`.
    #[serde(default)]
    pub role_attributes: Map<String, JsonValue>,
}

impl Accountability {
    /// A non-admin caller with the given roles.
    pub fn new(user: Option<&str>, roles: &[&str]) -> Self {
        Self {
            user: user.map(str::to_string),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            ..Default::default()
        }
    }

    /// An unrestricted administrator.
    pub fn admin() -> Self {
        Self {
            admin: true,
            ..Default::default()
        }
    }

    pub fn with_user_attributes(mut self, attributes: Map<String, JsonValue>) -> Self {
        self.user_attributes = attributes;
        self
    }

    pub fn with_role_attributes(mut self, attributes: Map<String, JsonValue>) -> Self {
        self.role_attributes = attributes;
        self
    }

    /// The primary role (`$CURRENT_ROLE`).
    pub fn role(&self) -> Option<&str> {
        self.roles.first().map(String::as_str)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_role() {
        let acc = Accountability::new(Some("u1"), &["editor", "public"]);
        assert_eq!(acc.role(), Some("editor"));
        assert!(acc.has_role("public"));
        assert!(!acc.admin);
    }

    #[test]
    fn test_deserialize_defaults() {
        let acc: Accountability = serde_json::from_str(r#"{"user": "u1"}"#).unwrap();
        assert!(acc.roles.is_empty());
        assert!(acc.user_attributes.is_empty());
    }
}
