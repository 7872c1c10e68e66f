//! Cache key derivation.
//!
//! The middleware and the warmer both derive keys here, so an entry warmed for
//! `(path, identity, params)` is exactly the entry a later read looks up.

use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};

/// Identity used when the caller is not authenticated.
pub const ANONYMOUS: &str = "anonymous";

const ROUTE_NAMESPACE: &str = "route:";
const EMPTY_PARAMS_DIGEST: &str = "-";
const DIGEST_HEX_LEN: usize = 16;

/// Query parameters in canonical order: keys sorted, values per key sorted.
pub type CanonicalParams = BTreeMap<String, Vec<String>>;

/// Store-relative cache key (the store applies the namespace prefix).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for a read request.
    pub fn for_request(path: &str, identity: Option<&str>, params: &CanonicalParams) -> Self {
        let identity = identity.filter(|id| !id.is_empty()).unwrap_or(ANONYMOUS);
        Self(format!(
            "{ROUTE_NAMESPACE}{}:{identity}:{}",
            normalize_path(path),
            params_digest(params)
        ))
    }

    /// Globs matching every cached variant of the resource family that `path` belongs to.
    ///
    /// The family is the first two path segments, so a write to
    /// `/api/objectives/42` also drops cached `/api/objectives` listings.
    /// One glob covers the family root, the other its sub-paths; siblings
    /// sharing the prefix (`/api/objectives_archive`) are left alone.
    pub fn family_patterns(path: &str) -> Vec<String> {
        let family: Vec<&str> = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .take(2)
            .collect();
        let family = escape_glob(&family.join("/"));
        vec![
            format!("{ROUTE_NAMESPACE}/{family}:*"),
            format!("{ROUTE_NAMESPACE}/{family}/*"),
        ]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonicalize `(key, value)` pairs irrespective of insertion order.
pub fn canonical_params<I, K, V>(pairs: I) -> CanonicalParams
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let mut params = CanonicalParams::new();
    for (key, value) in pairs {
        params.entry(key.into()).or_default().push(value.into());
    }
    for values in params.values_mut() {
        values.sort();
    }
    params
}

/// Parse a raw URL query string into canonical parameters.
pub fn parse_query(query: Option<&str>) -> CanonicalParams {
    match query {
        Some(raw) if !raw.is_empty() => canonical_params(
            url::form_urlencoded::parse(raw.as_bytes())
                .map(|(key, value)| (key.into_owned(), value.into_owned())),
        ),
        _ => CanonicalParams::new(),
    }
}

fn params_digest(params: &CanonicalParams) -> String {
    if params.is_empty() {
        return EMPTY_PARAMS_DIGEST.to_string();
    }
    // BTreeMap serializes in key order, so the JSON is canonical.
    let canonical = serde_json::to_string(params).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hex::encode(hasher.finalize().to_vec());
    digest[..DIGEST_HEX_LEN].to_string()
}

fn normalize_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { "/" } else { trimmed }
}

/// Escape glob metacharacters so `raw` matches only itself.
pub(crate) fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '{' | '}' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_order_does_not_change_key() {
        let a = canonical_params([("status", "active"), ("domain", "sales")]);
        let b = canonical_params([("domain", "sales"), ("status", "active")]);
        assert_eq!(
            CacheKey::for_request("/api/objectives", None, &a),
            CacheKey::for_request("/api/objectives", None, &b)
        );
    }

    #[test]
    fn repeated_values_are_sorted() {
        let a = parse_query(Some("tag=b&tag=a"));
        let b = parse_query(Some("tag=a&tag=b"));
        assert_eq!(a, b);
        assert_eq!(a["tag"], ["a", "b"]);
    }

    #[test]
    fn identity_and_params_distinguish_keys() {
        let params = parse_query(Some("domain=sales"));
        let anonymous = CacheKey::for_request("/api/objectives", None, &params);
        let alice = CacheKey::for_request("/api/objectives", Some("alice"), &params);
        let unfiltered = CacheKey::for_request("/api/objectives", None, &CanonicalParams::new());

        assert_ne!(anonymous, alice);
        assert_ne!(anonymous, unfiltered);
        assert_eq!(unfiltered.as_str(), "route:/api/objectives:anonymous:-");
        assert!(anonymous.as_str().starts_with("route:/api/objectives:anonymous:"));
        assert_eq!(
            anonymous.as_str().rsplit(':').next().map(str::len),
            Some(DIGEST_HEX_LEN)
        );
    }

    #[test]
    fn trailing_slash_is_ignored() {
        let params = CanonicalParams::new();
        assert_eq!(
            CacheKey::for_request("/api/domains/", Some(""), &params),
            CacheKey::for_request("/api/domains", None, &params)
        );
    }

    #[test]
    fn family_patterns_use_first_two_segments() {
        let expected = ["route:/api/objectives:*", "route:/api/objectives/*"];
        assert_eq!(CacheKey::family_patterns("/api/objectives/42"), expected);
        assert_eq!(CacheKey::family_patterns("/api/objectives"), expected);
        assert_eq!(
            CacheKey::family_patterns("/weird[1]"),
            ["route:/weird\\[1\\]:*", "route:/weird\\[1\\]/*"]
        );
    }

    #[test]
    fn family_patterns_skip_sibling_prefixes() {
        let matchers: Vec<_> = CacheKey::family_patterns("/api/objectives")
            .iter()
            .map(|pattern| {
                globset::GlobBuilder::new(pattern)
                    .literal_separator(false)
                    .backslash_escape(true)
                    .build()
                    .expect("valid glob")
                    .compile_matcher()
            })
            .collect();
        let matches = |key: &CacheKey| matchers.iter().any(|glob| glob.is_match(key.as_str()));
        let params = CanonicalParams::new();

        assert!(matches(&CacheKey::for_request("/api/objectives", None, &params)));
        assert!(matches(&CacheKey::for_request("/api/objectives/42", Some("alice"), &params)));
        assert!(!matches(&CacheKey::for_request("/api/objectives_archive", None, &params)));
        assert!(!matches(&CacheKey::for_request("/api/objectivesx/1", None, &params)));
    }

    #[test]
    fn escape_glob_escapes_metacharacters() {
        assert_eq!(escape_glob("app[1]*:"), "app\\[1\\]\\*:");
        assert_eq!(escape_glob("plain:"), "plain:");
    }

    mod prop {
        use proptest::prelude::*;

        use super::super::*;

        fn pairs() -> impl Strategy<Value = Vec<(String, String)>> {
            prop::collection::vec(("[a-c]", "[a-z ]{0,3}"), 0..8)
        }

        proptest! {
            #[test]
            fn shuffled_pairs_give_the_same_key(
                (original, shuffled) in pairs()
                    .prop_flat_map(|pairs| (Just(pairs.clone()), Just(pairs).prop_shuffle()))
            ) {
                let key = |params: &CanonicalParams| CacheKey::for_request("/api/objectives", None, params);
                let expected = key(&canonical_params(original));
                prop_assert_eq!(&expected, &key(&canonical_params(shuffled.clone())));

                let encode = |pairs: &[(String, String)]| {
                    url::form_urlencoded::Serializer::new(String::new())
                        .extend_pairs(pairs)
                        .finish()
                };
                let parsed = key(&parse_query(Some(encode(&shuffled).as_str())));
                prop_assert_eq!(&expected, &parsed);
            }
        }
    }
}
