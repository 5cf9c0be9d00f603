// SPDX-License-Identifier: PMPL-1.0-or-later
//! Dot-paths and field functions.
//!
//! A [`FieldPath`] is the parsed form of strings such as `ngo_id.name`,
//! `year(date_created)` or `a.b.count(c.d)`. A function always applies to the
//! last segment: `a.b.func(c.d)` becomes path `a.b.c.d` with `func` on `d`.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{QueryError, Result};

static FUNCTION_KEY: OnceLock<Regex> = OnceLock::new();

fn function_key() -> &'static Regex {
    FUNCTION_KEY.get_or_init(|| {
        Regex::new(r"^(?:(?P<prefix>[^()]*)\.)?(?P<func>[A-Za-z_]+)\((?P<inner>[^()]+)\)$")
            .expect("function key pattern is valid")
    })
}

/// A function applied to the terminal field of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldFunction {
    Year,
    Month,
    Week,
    Day,
    Weekday,
    Hour,
    Minute,
    Second,
    /// Number of related items, or of elements in a json/csv array.
    Count,
}

impl FieldFunction {
    /// Date-part extraction functions.
    pub fn is_temporal(self) -> bool {
        !matches!(self, FieldFunction::Count)
    }
}

impl fmt::Display for FieldFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldFunction::Year => "year",
            FieldFunction::Month => "month",
            FieldFunction::Week => "week",
            FieldFunction::Day => "day",
            FieldFunction::Weekday => "weekday",
            FieldFunction::Hour => "hour",
            FieldFunction::Minute => "minute",
            FieldFunction::Second => "second",
            FieldFunction::Count => "count",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for FieldFunction {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "year" => Ok(FieldFunction::Year),
            "month" => Ok(FieldFunction::Month),
            "week" => Ok(FieldFunction::Week),
            "day" => Ok(FieldFunction::Day),
            "weekday" => Ok(FieldFunction::Weekday),
            "hour" => Ok(FieldFunction::Hour),
            "minute" => Ok(FieldFunction::Minute),
            "second" => Ok(FieldFunction::Second),
            "count" => Ok(FieldFunction::Count),
            other => Err(QueryError::invalid(format!("unknown function \"{other}\""))),
        }
    }
}

/// A parsed dot-path with an optional function on its last segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
    segments: Vec<String>,
    function: Option<FieldFunction>,
}

impl FieldPath {
    /// Parse a dot-path, splitting off a trailing function call.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(QueryError::invalid("empty field path"));
        }

        if !raw.contains('(') {
            return Ok(Self {
                segments: split_segments(raw)?,
                function: None,
            });
        }

        let caps = function_key()
            .captures(raw)
            .ok_or_else(|| QueryError::invalid(format!("malformed function call in \"{raw}\"")))?;
        let function: FieldFunction = caps["func"].parse()?;
        let mut segments = match caps.name("prefix") {
            Some(prefix) => split_segments(prefix.as_str())?,
            None => Vec::new(),
        };
        segments.extend(split_segments(&caps["inner"])?);

        Ok(Self {
            segments,
            function: Some(function),
        })
    }

    /// Build a path from already-split segments.
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
            function: None,
        }
    }

    pub fn with_function(mut self, function: Option<FieldFunction>) -> Self {
        self.function = function;
        self
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn function(&self) -> Option<FieldFunction> {
        self.function
    }

    /// The terminal segment.
    pub fn last(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    /// Segments before the terminal one.
    pub fn parents(&self) -> &[String] {
        &self.segments[..self.segments.len().saturating_sub(1)]
    }

    /// Number of relation hops taken before the terminal segment.
    pub fn depth(&self) -> usize {
        self.segments.len().saturating_sub(1)
    }

    pub fn is_wildcard(&self) -> bool {
        self.last() == "*"
    }

    /// Prepend `prefix` segments, keeping the function.
    pub fn prefixed(&self, prefix: &[String]) -> Self {
        let mut segments = prefix.to_vec();
        segments.extend(self.segments.iter().cloned());
        Self {
            segments,
            function: self.function,
        }
    }

    /// Path string without the function wrapper (`a.b.c`).
    pub fn dotted(&self) -> String {
        self.segments.join(".")
    }
}

fn split_segments(raw: &str) -> Result<Vec<String>> {
    raw.split('.')
        .map(|segment| {
            let segment = segment.trim();
            if segment.is_empty() || segment.contains(char::is_whitespace) {
                Err(QueryError::invalid(format!("malformed field path \"{raw}\"")))
            } else {
                Ok(segment.to_string())
            }
        })
        .collect()
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.function {
            None => write!(f, "{}", self.dotted()),
            Some(func) => {
                let parents = self.parents();
                if !parents.is_empty() {
                    write!(f, "{}.", parents.join("."))?;
                }
                write!(f, "{}({})", func, self.last())
            }
        }
    }
}

impl FromStr for FieldPath {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        FieldPath::parse(s)
    }
}

impl TryFrom<String> for FieldPath {
    type Error = QueryError;

    fn try_from(s: String) -> Result<Self> {
        FieldPath::parse(&s)
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.to_string()
    }
}
