//! Request fingerprinting.
//!
//! A fingerprint is the cache key: a SHA-256 digest over the parts of a
//! request that define its cacheable identity. Query parameters and header
//! values are absorbed name-sorted and value-sorted, so two requests that
//! differ only in parameter order, multi-value order or header-line order
//! hash to the same key. Distinct delimiters (`:`, `&`, `|`, `=`) keep the
//! path, query and header regions from colliding with each other.
//!
//! Configured path prefixes short-circuit hashing entirely: every request
//! under such a prefix maps to one literal key, which collapses whole
//! sub-trees (static assets, bundled frontends) into a single entry.

use std::collections::{BTreeMap, HashSet};

use http::request::Parts;
use sha2::{Digest, Sha256};

/// Selects which parts of a request participate in its fingerprint.
#[derive(Debug, Clone, Default)]
pub struct KeyConfig {
    /// Include query parameters in the fingerprint.
    pub hash_query: bool,
    /// Parameter names excluded from the fingerprint, lowercase. Matching is
    /// case-insensitive.
    pub query_ignore: HashSet<String>,
    /// Header names whose values participate in the fingerprint.
    pub hash_headers: Vec<String>,
    /// Ordered `(path prefix, literal key)` pairs. The first prefix matching
    /// the request path wins and bypasses hashing altogether.
    pub global_keys: Vec<(String, String)>,
}

/// Computes the cache key for a request: either a configured global key or a
/// 64-character lowercase hex SHA-256 digest.
pub fn fingerprint(parts: &Parts, config: &KeyConfig) -> String {
    let path = parts.uri.path();
    for (prefix, key) in &config.global_keys {
        if path.starts_with(prefix.as_str()) {
            return key.clone();
        }
    }

    let mut hasher = Sha256::new();
    hasher.update(parts.method.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(path.as_bytes());

    if config.hash_query {
        // BTreeMap orders parameter names; values are sorted per name below.
        let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
        if let Some(query) = parts.uri.query() {
            for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
                if config.query_ignore.contains(&name.to_ascii_lowercase()) {
                    continue;
                }
                params.entry(name.into_owned()).or_default().push(value.into_owned());
            }
        }
        for (name, mut values) in params {
            values.sort();
            for value in values {
                hasher.update(b"&");
                hasher.update(name.as_bytes());
                hasher.update(b"=");
                hasher.update(value.as_bytes());
            }
        }
    }

    if !config.hash_headers.is_empty() {
        let mut names: Vec<&str> = config.hash_headers.iter().map(String::as_str).collect();
        names.sort_unstable();
        for name in names {
            let mut values: Vec<&str> = parts
                .headers
                .get_all(name)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .collect();
            values.sort_unstable();
            for value in values {
                hasher.update(b"|");
                hasher.update(name.as_bytes());
                hasher.update(b"=");
                hasher.update(value.as_bytes());
            }
        }
    }

    hex::encode(hasher.finalize())
}
