//! Provider selectors
//!
//! A selector resolves to exactly one upstream at dispatch time: an
//! explicit name, or a `tag:`/`version:` predicate narrowed to the
//! candidates visible to the calling principal, with breaker-aware
//! filtering and a strategy-driven tie-break.

use semver::VersionReq;

use crate::error::{RouterError, RouterResult};

/// Parsed form of the selector grammar:
/// `name | "tag:" tag | "tag:" tag "@" range | "version:" range`.
#[derive(Debug, Clone)]
pub enum Selector {
    Name(String),
    Tag { tag: String, range: Option<VersionReq> },
    Version(VersionReq),
}

impl Selector {
    pub fn parse(input: &str) -> RouterResult<Self> {
        if let Some(rest) = input.strip_prefix("tag:") {
            let (tag, range) = match rest.split_once('@') {
                None => (rest, None),
                Some((tag, range)) => (tag, Some(parse_range(range)?)),
            };
            if tag.is_empty() {
                return Err(RouterError::BadRequest(format!(
                    "selector '{input}' has an empty tag"
                )));
            }
            return Ok(Selector::Tag {
                tag: tag.to_string(),
                range,
            });
        }
        if let Some(range) = input.strip_prefix("version:") {
            return Ok(Selector::Version(parse_range(range)?));
        }
        if input.is_empty() {
            return Err(RouterError::BadRequest("empty provider selector".into()));
        }
        Ok(Selector::Name(input.to_string()))
    }

    /// Explicit-name selectors bypass candidate filtering entirely.
    pub fn as_explicit_name(&self) -> Option<&str> {
        match self {
            Selector::Name(name) => Some(name),
            _ => None,
        }
    }
}

fn parse_range(range: &str) -> RouterResult<VersionReq> {
    VersionReq::parse(range.trim())
        .map_err(|e| RouterError::BadRequest(format!("invalid semver range '{range}': {e}")))
}

/// Strategy-driven pick among an ordered candidate set.
pub enum Strategy<'a> {
    /// Per-selector counter owned by the session.
    RoundRobin { counter: &'a mut usize },
    /// Injectable RNG in `[0, 1)` for deterministic tests.
    Random { rng: &'a dyn Fn() -> f64 },
}

impl Strategy<'_> {
    pub fn pick<'c>(self, candidates: &'c [String]) -> &'c str {
        debug_assert!(!candidates.is_empty());
        match self {
            Strategy::RoundRobin { counter } => {
                let index = *counter % candidates.len();
                *counter = counter.wrapping_add(1);
                &candidates[index]
            }
            Strategy::Random { rng } => {
                let index = ((rng() * candidates.len() as f64) as usize).min(candidates.len() - 1);
                &candidates[index]
            }
        }
    }
}
