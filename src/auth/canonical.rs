//! Canonical request hashing
//!
//! Inbound tokens carry a `qsh` claim: the SHA-256 of the request reduced to
//! `METHOD&PATH&QUERY`. Both sides must build that string identically, so the
//! rules here are fixed:
//!
//! - method is upper-cased
//! - path has the add-on context prefix removed, `&` encoded as `%26`, and no
//!   trailing slash (except `/` itself)
//! - query excludes the `jwt` parameter, percent-encodes keys and values
//!   (RFC 3986), sorts by key, and joins repeated values with `,`

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Query parameter carrying the inbound token, never part of the hash
pub const JWT_PARAM_NAME: &str = "jwt";

/// A request reduced to the parts covered by the query hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRequest {
    method: String,
    path: String,
    params: BTreeMap<String, Vec<String>>,
}

impl CanonicalRequest {
    /// Build a canonical request.
    ///
    /// `context_path` is the prefix the add-on is mounted under; an empty
    /// string or `/` means no prefix.
    pub fn new<I, K, V>(method: &str, path: &str, context_path: &str, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (key, value) in params {
            let key = key.as_ref();
            if key == JWT_PARAM_NAME {
                continue;
            }
            grouped
                .entry(percent_encode(key))
                .or_default()
                .push(percent_encode(value.as_ref()));
        }
        for values in grouped.values_mut() {
            values.sort();
        }

        Self {
            method: method.trim().to_uppercase(),
            path: canonical_path(path, context_path),
            params: grouped,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Path relative to the add-on context, already encoded
    pub fn path(&self) -> &str {
        &self.path
    }

    /// `METHOD&PATH&QUERY`
    pub fn canonicalize(&self) -> String {
        let query = self
            .params
            .iter()
            .map(|(key, values)| format!("{}={}", key, values.join(",")))
            .collect::<Vec<_>>()
            .join("&");

        format!("{}&{}&{}", self.method, self.path, query)
    }

    /// Lowercase hex SHA-256 of [`canonicalize`](Self::canonicalize)
    pub fn query_hash(&self) -> String {
        hex::encode(Sha256::digest(self.canonicalize().as_bytes()))
    }
}

/// RFC 3986 percent-encoding (only unreserved characters pass through)
pub fn percent_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

fn canonical_path(path: &str, context_path: &str) -> String {
    let relative = strip_context(path, context_path);

    let mut canonical = if relative.starts_with('/') {
        relative.to_string()
    } else {
        format!("/{}", relative)
    };

    while canonical.len() > 1 && canonical.ends_with('/') {
        canonical.pop();
    }

    canonical.replace('&', "%26")
}

fn strip_context<'a>(path: &'a str, context_path: &str) -> &'a str {
    let context = context_path.trim_end_matches('/');
    if context.is_empty() {
        return path;
    }

    match path.strip_prefix(context) {
        Some("") => "/",
        Some(rest) if rest.starts_with('/') => rest,
        _ => path,
    }
}
