//! Deterministic cache-key derivation from query kind and parameters.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

/// Bumped whenever the derivation rules change in a way that should
/// invalidate previously-written cache entries.
pub const FINGERPRINT_VERSION: u8 = 1;

/// The top-level query kind a fingerprint is derived for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintKind {
    Search,
    Enrich,
    Cover,
    Ai,
}

impl FingerprintKind {
    fn as_str(self) -> &'static str {
        match self {
            FingerprintKind::Search => "search",
            FingerprintKind::Enrich => "enrich",
            FingerprintKind::Cover => "cover",
            FingerprintKind::Ai => "ai",
        }
    }
}

/// The cache-kind discriminant used to look up a TTL policy. This is a
/// concrete realization of the query-kind space the cache key derivation
/// operates over (see `book_config::CacheTtlTable`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum CacheKind {
    IsbnEnrich,
    IsbnSearch,
    TitleAuthorSearch,
    Cover,
    AiParse,
}

/// Whether a fingerprint parameter value should be treated as an ISBN
/// (digits-only normalization) or free text (NFC/lowercase/whitespace
/// collapse).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Isbn,
    Text,
}

/// Normalize a single parameter value according to `kind`.
fn normalize_value(value: &str, kind: ParamKind) -> String {
    match kind {
        ParamKind::Isbn => value.chars().filter(|c| c.is_ascii_digit()).collect(),
        ParamKind::Text => {
            let nfc: String = value.nfc().collect();
            collapse_whitespace(&nfc.to_lowercase())
        }
    }
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_space = false;
    for c in s.trim().chars() {
        if c.is_whitespace() {
            if !prev_space {
                out.push(' ');
            }
            prev_space = true;
        } else {
            out.push(c);
            prev_space = false;
        }
    }
    out
}

/// A single, lowercased-and-trimmed `key=value` parameter contributing to a
/// fingerprint.
#[derive(Debug, Clone)]
pub struct Param {
    pub key: &'static str,
    pub value: String,
    pub kind: ParamKind,
}

impl Param {
    pub fn new(key: &'static str, value: impl AsRef<str>, kind: ParamKind) -> Self {
        Self {
            key,
            value: value.as_ref().to_string(),
            kind,
        }
    }
}

/// Compute the deterministic fingerprint string:
/// `v{version}:{kind}:{subkind}:{k1=v1&k2=v2...}` with pairs sorted
/// lexicographically by key and values normalized per [`ParamKind`].
///
/// Pure and stable: identical inputs always produce an identical string.
pub fn fingerprint(kind: FingerprintKind, subkind: &str, params: &[Param]) -> String {
    let mut pairs: Vec<(String, String)> = params
        .iter()
        .map(|p| (p.key.to_lowercase(), normalize_value(&p.value, p.kind)))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let joined = pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "v{FINGERPRINT_VERSION}:{}:{}:{}",
        kind.as_str(),
        subkind.to_lowercase().trim(),
        joined
    )
}

/// Derive the edge-cache lookup key (a URL-shaped form) from a fingerprint.
pub fn edge_key(fp: &str) -> String {
    format!("/edge/{fp}")
}
