//! Query text normalization for pattern grouping.

use std::borrow::Cow;
use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;

const PLACEHOLDER: &str = "?";

/// Positional placeholders first so `$1` is never mistaken for a numeric literal.
static LITERALS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<positional>\$\d+)|'(?:[^']|'')*'|\b\d+(?:\.\d+)?\b")
        .expect("literal pattern is valid")
});
static IN_LIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bIN\s*\(\s*\?(?:\s*,\s*\?)*\s*\)").expect("in-list pattern is valid")
});
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace is valid"));

/// Aggregate for one normalized query shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPattern {
    pub pattern: String,
    pub count: usize,
    pub total_duration_ms: f64,
    pub avg_duration_ms: f64,
}

/// Replace literal values in `query` with a placeholder.
pub fn normalize_query(query: &str) -> String {
    let replaced = LITERALS.replace_all(query, |caps: &Captures<'_>| match caps.name("positional") {
        Some(positional) => positional.as_str().to_string(),
        None => PLACEHOLDER.to_string(),
    });
    let collapsed = IN_LIST.replace_all(&replaced, "IN (?)");
    let compact: Cow<'_, str> = WHITESPACE.replace_all(&collapsed, " ");
    compact.trim().to_string()
}

/// Group `(query, duration)` samples by normalized shape, most frequent first.
pub(crate) fn group_patterns<'a, I>(samples: I) -> Vec<QueryPattern>
where
    I: IntoIterator<Item = (&'a str, f64)>,
{
    let mut groups: HashMap<String, (usize, f64)> = HashMap::new();
    for (query, duration_ms) in samples {
        let entry = groups.entry(normalize_query(query)).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += duration_ms;
    }

    let mut patterns: Vec<QueryPattern> = groups
        .into_iter()
        .map(|(pattern, (count, total))| QueryPattern {
            pattern,
            count,
            total_duration_ms: total,
            avg_duration_ms: total / count as f64,
        })
        .collect();

    patterns.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.pattern.cmp(&b.pattern)));
    patterns
}
