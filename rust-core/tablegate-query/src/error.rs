// SPDX-License-Identifier: PMPL-1.0-or-later
//! Query compilation error types.
//!
//! Every variant is client-caused and non-retryable. The HTTP layer maps
//! [`QueryError::kind`] to a status code; messages name the offending path,
//! operator or limit but never the permission rules of any role.

use thiserror::Error;

/// Errors that can occur while normalizing, validating or compiling a query.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("unknown field \"{path}\" in collection \"{collection}\"")]
    UnknownField { collection: String, path: String },

    #[error("unknown operator: {0}")]
    UnknownOperator(String),

    #[error("operator {operator} cannot be used on \"{path}\": {reason}")]
    TypeMismatch {
        path: String,
        operator: String,
        reason: String,
    },

    #[error("path \"{path}\" is nested {depth} relations deep, the maximum is {max}")]
    QueryTooComplex { path: String, depth: usize, max: usize },

    #[error("you don't have permission to {action} {target}")]
    Forbidden { action: String, target: String },

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl QueryError {
    /// Shorthand for [`QueryError::InvalidQuery`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        QueryError::InvalidQuery(reason.into())
    }

    /// Denial for a whole collection.
    pub fn forbidden_collection(action: impl ToString, collection: &str) -> Self {
        QueryError::Forbidden {
            action: action.to_string(),
            target: format!("collection \"{collection}\""),
        }
    }

    /// Denial for a single field of a collection.
    pub fn forbidden_field(action: impl ToString, collection: &str, field: &str) -> Self {
        QueryError::Forbidden {
            action: action.to_string(),
            target: format!("field \"{field}\" of collection \"{collection}\""),
        }
    }

    /// Stable machine-readable code for the error.
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::InvalidQuery(_) => "INVALID_QUERY",
            QueryError::UnknownField { .. } => "UNKNOWN_FIELD",
            QueryError::UnknownOperator(_) => "UNKNOWN_OPERATOR",
            QueryError::TypeMismatch { .. } => "TYPE_MISMATCH",
            QueryError::QueryTooComplex { .. } => "QUERY_TOO_COMPLEX",
            QueryError::Forbidden { .. } => "FORBIDDEN",
            QueryError::InvalidSchema(_) => "INVALID_SCHEMA",
            QueryError::InvalidConfig(_) => "INVALID_CONFIG",
        }
    }

    /// Whether the error was caused by the request rather than the deployment.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            QueryError::InvalidSchema(_) | QueryError::InvalidConfig(_)
        )
    }
}

/// Result alias used throughout the pipeline.
pub type Result<T> = std::result::Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_message_names_target_only() {
        let err = QueryError::forbidden_field("read", "grants", "budget");
        assert_eq!(
            err.to_string(),
            "you don't have permission to read field \"budget\" of collection \"grants\""
        );
        assert_eq!(err.kind(), "FORBIDDEN");
    }

    #[test]
    fn test_client_error_classification() {
        assert!(QueryError::invalid("x").is_client_error());
        assert!(QueryError::UnknownOperator("_foo".into()).is_client_error());
        assert!(!QueryError::InvalidSchema("x".into()).is_client_error());
        assert!(!QueryError::InvalidConfig("x".into()).is_client_error());
    }
}
