//! Include/exclude filtering of database names.
//!
//! A pattern is one of three shapes: an exact name, a trailing wildcard (`prefix*`)
//! or a leading wildcard (`*suffix`). Only one wildcard position is honored per
//! pattern; a leading `*` always wins, so `*abc*` behaves like `*abc`.
//! Matching is case-sensitive.

use derive_more::Display;
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::Formatter;
use std::result;
use std::str::FromStr;
use thiserror::Error;

const WILDCARD: char = '*';

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid name pattern {pattern:?}: {reason}")]
pub struct InvalidPatternError {
    pattern: String,
    reason: &'static str,
}

/// A parsed include/exclude pattern.
#[derive(Clone, Debug, Display, PartialEq, Eq, Hash)]
pub enum NamePattern {
    #[display("{_0}")]
    Exact(String),
    #[display("{_0}*")]
    Prefix(String),
    #[display("*{_0}")]
    Suffix(String),
}

impl NamePattern {
    pub fn parse<S: AsRef<str>>(pattern: S) -> result::Result<Self, InvalidPatternError> {
        let pattern = pattern.as_ref();
        if pattern.is_empty() {
            return Err(InvalidPatternError {
                pattern: pattern.into(),
                reason: "pattern must not be empty",
            });
        }

        if let Some(rest) = pattern.strip_prefix(WILDCARD) {
            let suffix = rest.strip_suffix(WILDCARD).unwrap_or(rest);
            return Ok(Self::Suffix(suffix.into()));
        }

        match pattern.strip_suffix(WILDCARD) {
            Some(prefix) => Ok(Self::Prefix(prefix.into())),
            None => Ok(Self::Exact(pattern.into())),
        }
    }

    pub fn is_match(&self, name: &str) -> bool {
        match self {
            Self::Exact(exact) => name == exact,
            Self::Prefix(prefix) => name.starts_with(prefix.as_str()),
            Self::Suffix(suffix) => name.ends_with(suffix.as_str()),
        }
    }
}

impl FromStr for NamePattern {
    type Err = InvalidPatternError;

    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for NamePattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct NamePatternVisitor;

impl Visitor<'_> for NamePatternVisitor {
    type Value = NamePattern;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a non-empty name pattern such as \"app\", \"app*\" or \"*_log\"")
    }

    fn visit_str<E>(self, v: &str) -> result::Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        NamePattern::parse(v).map_err(serde::de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for NamePattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        deserializer.deserialize_str(NamePatternVisitor)
    }
}

fn matches_any(name: &str, patterns: &[NamePattern]) -> bool {
    patterns.iter().any(|p| p.is_match(name))
}

/// Decides whether `name` is backed up.
///
/// No include patterns means everything is included; no exclude patterns means
/// nothing is excluded. A name matching both sides is excluded.
pub fn should_include(name: &str, include: &[NamePattern], exclude: &[NamePattern]) -> bool {
    let included = include.is_empty() || matches_any(name, include);
    let excluded = !exclude.is_empty() && matches_any(name, exclude);
    tracing::trace!("Filtering {name:?}: included={included}, excluded={excluded}");
    included && !excluded
}
