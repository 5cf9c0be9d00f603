// SPDX-License-Identifier: PMPL-1.0-or-later
//! Compiler configuration.
//!
//! All limits the pipeline enforces live here and are passed explicitly into
//! [`Compiler`](crate::Compiler). Defaults:
//! - `QUERY_LIMIT_DEFAULT`: 100
//! - `QUERY_LIMIT_MAX`: 1000
//! - `MAX_RELATIONAL_DEPTH`: 10
//! - `FILTER_MAX_NESTING`: 32

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{QueryError, Result};

pub const QUERY_LIMIT_DEFAULT: u64 = 100;
pub const QUERY_LIMIT_MAX: u64 = 1000;
pub const MAX_RELATIONAL_DEPTH: usize = 10;
pub const FILTER_MAX_NESTING: usize = 32;

/// Configuration for the query compiler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Limit applied when the query does not specify one.
    pub query_limit_default: u64,
    /// Largest limit a caller may request.
    pub query_limit_max: u64,
    /// Maximum number of relation hops in any dot-path.
    pub max_relational_depth: usize,
    /// Maximum nesting of `_and` / `_or` / `_not` groups in a filter.
    pub filter_max_nesting: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            query_limit_default: QUERY_LIMIT_DEFAULT,
            query_limit_max: QUERY_LIMIT_MAX,
            max_relational_depth: MAX_RELATIONAL_DEPTH,
            filter_max_nesting: FILTER_MAX_NESTING,
        }
    }
}

impl CompilerConfig {
    /// Load the configuration from the process environment.
    ///
    /// Variables that are missing keep their default; variables that fail to
    /// parse are logged and also keep their default.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load the configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            query_limit_default: read_var(&lookup, "QUERY_LIMIT_DEFAULT", defaults.query_limit_default),
            query_limit_max: read_var(&lookup, "QUERY_LIMIT_MAX", defaults.query_limit_max),
            max_relational_depth: read_var(&lookup, "MAX_RELATIONAL_DEPTH", defaults.max_relational_depth),
            filter_max_nesting: read_var(&lookup, "FILTER_MAX_NESTING", defaults.filter_max_nesting),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that the limits are mutually consistent.
    pub fn validate(&self) -> Result<()> {
        if self.query_limit_max == 0 {
            return Err(QueryError::InvalidConfig(
                "QUERY_LIMIT_MAX must be greater than zero".to_string(),
            ));
        }
        if self.query_limit_default == 0 || self.query_limit_default > self.query_limit_max {
            return Err(QueryError::InvalidConfig(format!(
                "QUERY_LIMIT_DEFAULT must be between 1 and QUERY_LIMIT_MAX ({})",
                self.query_limit_max
            )));
        }
        if self.filter_max_nesting == 0 {
            return Err(QueryError::InvalidConfig(
                "FILTER_MAX_NESTING must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn read_var<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + Copy,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "Ignoring unparsable configuration value");
                default
            }
        },
        _ => default,
    }
}
