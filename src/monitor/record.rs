//! Query records held in the monitor's ring buffer.

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

const ELLIPSIS: &str = "...";

/// One observed persistence-layer call.
#[derive(Debug, Clone, Serialize)]
pub struct QueryRecord {
    pub query: String,
    pub duration_ms: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<String>>,
    pub slow: bool,
    /// Call stack captured when the record was classified slow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Truncate query text to at most `max_chars` characters.
pub(crate) fn truncate_query(query: &str, max_chars: usize) -> String {
    match query.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => query[..byte_idx].to_string(),
        None => query.to_string(),
    }
}

/// Render a parameter for storage, truncating long values with an ellipsis marker.
pub(crate) fn snapshot_param(value: &Value, max_chars: usize) -> String {
    let rendered = match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };

    match rendered.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}{ELLIPSIS}", &rendered[..byte_idx]),
        None => rendered,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn query_is_cut_at_char_boundary() {
        let query = "SELECT 'ééé'";
        assert_eq!(truncate_query(query, 9), "SELECT 'é");
        assert_eq!(truncate_query(query, 500), query);
    }

    #[test]
    fn long_params_get_ellipsis() {
        let long = "x".repeat(150);
        let stored = snapshot_param(&json!(long), 100);
        assert_eq!(stored.len(), 103);
        assert!(stored.ends_with("..."));
    }

    #[test]
    fn short_and_non_string_params_are_kept() {
        assert_eq!(snapshot_param(&json!("abc"), 100), "abc");
        assert_eq!(snapshot_param(&json!(42), 100), "42");
        assert_eq!(snapshot_param(&json!(null), 100), "null");
        assert_eq!(snapshot_param(&json!({"a": 1}), 100), r#"{"a":1}"#);
    }
}
