//! Prefix-rewrite translation of filesystem paths between the client's
//! namespace ("local") and the executor's namespace ("remote").
//!
//! Rules are tried in order and the first whose prefix matches wins. The
//! comparison is a plain string prefix check, so callers are expected to
//! hand in normalized absolute paths.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single `local <-> remote` prefix pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRule {
    pub local: String,
    pub remote: String,
}

impl MappingRule {
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MappingError {
    #[error("mapping rule {index} has an empty {side} prefix")]
    EmptyPrefix { index: usize, side: &'static str },

    #[error(
        "mapping rules {first} and {second} nest on the remote side but not on the local side; \
         paths under them would not map back to where they came from"
    )]
    Conflicting { first: usize, second: usize },
}

/// Ordered, immutable set of mapping rules.
#[derive(Debug, Clone, Default)]
pub struct PathMapper {
    rules: Vec<MappingRule>,
}

impl PathMapper {
    /// Validate and build a mapper.
    ///
    /// Two rules whose remote prefixes nest (`remote_b == remote_a + s`) must
    /// nest identically on the local side (`local_b == local_a + s`). Without
    /// that, `to_local(to_remote(p))` could land on a different rule than the
    /// one `p` went out through.
    pub fn new(rules: Vec<MappingRule>) -> Result<Self, MappingError> {
        for (index, rule) in rules.iter().enumerate() {
            if rule.local.is_empty() {
                return Err(MappingError::EmptyPrefix { index, side: "local" });
            }
            if rule.remote.is_empty() {
                return Err(MappingError::EmptyPrefix { index, side: "remote" });
            }
        }

        for (i, a) in rules.iter().enumerate() {
            for (j, b) in rules.iter().enumerate().skip(i + 1) {
                if !nests_consistently(a, b) || !nests_consistently(b, a) {
                    return Err(MappingError::Conflicting { first: i, second: j });
                }
            }
        }

        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[MappingRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Translate a client path into the executor's namespace.
    pub fn to_remote(&self, path: &str) -> String {
        rewrite(path, self.rules.iter().map(|r| (r.local.as_str(), r.remote.as_str())))
    }

    /// Translate an executor path back into the client's namespace.
    pub fn to_local(&self, path: &str) -> String {
        rewrite(path, self.rules.iter().map(|r| (r.remote.as_str(), r.local.as_str())))
    }
}

/// If `outer`'s remote prefix contains `inner`'s, the extra suffix must be
/// the same on the local side.
fn nests_consistently(outer: &MappingRule, inner: &MappingRule) -> bool {
    match inner.remote.strip_prefix(outer.remote.as_str()) {
        Some(suffix) => inner.local.strip_prefix(outer.local.as_str()) == Some(suffix),
        None => true,
    }
}

fn rewrite<'a>(path: &str, mut pairs: impl Iterator<Item = (&'a str, &'a str)>) -> String {
    pairs
        .find_map(|(from, to)| path.strip_prefix(from).map(|rest| format!("{to}{rest}")))
        .unwrap_or_else(|| path.to_string())
}
