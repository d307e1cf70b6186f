//! Model selection expressions.
//!
//! A pattern is an exact name or a `*` glob. A leading `+` adds every
//! upstream unit of each match, a trailing `+` adds every downstream unit.

use std::collections::BTreeSet;

use regex::Regex;

use crate::dag::Dag;
use crate::errors::{StrataError, StrataResult};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pattern {
    body: String,
    upstream: bool,
    downstream: bool,
}

impl Pattern {
    fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let upstream = trimmed.starts_with('+');
        let without_prefix = trimmed.trim_start_matches('+');
        let downstream = without_prefix.ends_with('+');
        Self {
            body: without_prefix.trim_end_matches('+').to_string(),
            upstream,
            downstream,
        }
    }

    fn matcher(&self) -> StrataResult<Option<Regex>> {
        if !self.body.contains('*') {
            return Ok(None);
        }
        let escaped = regex::escape(&self.body).replace(r"\*", ".*");
        Regex::new(&format!("^{escaped}$"))
            .map(Some)
            .map_err(|e| StrataError::InvalidOverride {
                model: self.body.clone(),
                reason: format!("invalid selection pattern: {e}"),
            })
    }
}

/// Names in `dag` matched by any of `patterns`, with requested
/// upstream and downstream expansion.
pub fn select(patterns: &[String], dag: &Dag) -> StrataResult<BTreeSet<String>> {
    let mut selected = BTreeSet::new();
    for raw in patterns {
        let pattern = Pattern::parse(raw);
        let matches: Vec<String> = match pattern.matcher()? {
            Some(regex) => dag.nodes().filter(|n| regex.is_match(n)).cloned().collect(),
            None if dag.contains(&pattern.body) => vec![pattern.body.clone()],
            None => Vec::new(),
        };
        for name in matches {
            if pattern.upstream {
                selected.extend(dag.upstream(&name));
            }
            if pattern.downstream {
                selected.extend(dag.downstream(&name));
            }
            selected.insert(name);
        }
    }
    Ok(selected)
}
