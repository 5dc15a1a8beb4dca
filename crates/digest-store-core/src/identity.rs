//! Content identity: URL normalization, content IDs, and fingerprints.
//!
//! Everything here is a pure function of its inputs. The storage layer relies
//! on that: a re-ingested `(url, body)` pair must land on the same
//! [`compute_content_id`] and therefore the same on-disk path.
//!
//! Near-duplicate detection uses two signals produced here:
//!
//! - the fingerprint digest, a SHA-256 over the sorted set of significant
//!   tokens (exact match is the fast path), and
//! - the token set itself, compared with [`jaccard`] when digests differ.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};
use url::Url;

/// Query parameters removed during normalization. Keys are compared
/// case-insensitively.
pub const DEFAULT_TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "source",
    "ref",
    "fbclid",
    "gclid",
    "ocid",
    "mc_cid",
    "mc_eid",
];

/// Words dropped before fingerprinting, in addition to short tokens.
const STOPWORDS: &[&str] = &[
    "and", "the", "for", "with", "this", "that", "from", "what", "have", "been",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl IdentityError {
    fn invalid(url: &str, reason: impl Into<String>) -> Self {
        IdentityError::InvalidUrl {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}

/// Options controlling [`normalize_url`].
#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    /// Lowercased query keys to strip.
    pub tracking_params: BTreeSet<String>,
}

impl NormalizeOptions {
    /// Built-in tracking parameters plus `extra`.
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut opts = Self::default();
        opts.tracking_params
            .extend(extra.into_iter().map(|s| s.as_ref().to_ascii_lowercase()));
        opts
    }
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            tracking_params: DEFAULT_TRACKING_PARAMS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

/// Options controlling significant-token extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenOptions {
    /// Tokens with fewer characters than this are ignored.
    pub min_length: usize,
    /// Upper bound on the number of retained tokens (the lexicographically
    /// smallest are kept).
    pub max_tokens: usize,
}

impl Default for TokenOptions {
    fn default() -> Self {
        Self {
            min_length: 4,
            max_tokens: 1000,
        }
    }
}

/// Canonicalize a URL for duplicate detection.
///
/// Lowercases scheme and host, drops default ports, the fragment, tracking
/// query parameters and a trailing slash on non-root paths, and sorts the
/// remaining query pairs. Only `http` and `https` URLs are accepted.
pub fn normalize_url(raw: &str, opts: &NormalizeOptions) -> Result<String, IdentityError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(IdentityError::invalid(raw, "empty URL"));
    }

    let mut url = Url::parse(trimmed).map_err(|e| IdentityError::invalid(raw, e.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(IdentityError::invalid(
                raw,
                format!("unsupported scheme '{}'", other),
            ))
        }
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(IdentityError::invalid(raw, "missing host"));
    }

    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !opts.tracking_params.contains(&k.to_ascii_lowercase()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs.iter());
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        let stripped = path.trim_end_matches('/');
        url.set_path(if stripped.is_empty() { "/" } else { stripped });
    }

    Ok(url.to_string())
}

/// SHA-256 of the normalized URL, hex encoded.
pub fn url_hash(normalized_url: &str) -> String {
    hex::encode(Sha256::digest(normalized_url.as_bytes()))
}

/// Deterministic content ID over `(normalized_url, body)`.
///
/// A NUL separator keeps `("a", "bc")` and `("ab", "c")` apart.
pub fn compute_content_id(normalized_url: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_url.as_bytes());
    hasher.update([0u8]);
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}

/// A fingerprint digest together with the token set it was computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub digest: String,
    /// Sorted, deduplicated significant tokens.
    pub tokens: Vec<String>,
}

impl Fingerprint {
    /// True when the body had no significant tokens. Such bodies take no
    /// part in content deduplication.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Jaccard similarity of this fingerprint's tokens against `other`.
    pub fn similarity(&self, other: &[String]) -> f64 {
        jaccard(&self.tokens, other)
    }
}

/// Extract the sorted, deduplicated set of significant tokens from `body`.
pub fn significant_tokens(body: &str, opts: &TokenOptions) -> Vec<String> {
    let set: BTreeSet<String> = body
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .filter(|t| t.chars().count() >= opts.min_length)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect();

    set.into_iter().take(opts.max_tokens).collect()
}

/// Compute the content fingerprint of a standardized body.
pub fn compute_fingerprint(body: &str, opts: &TokenOptions) -> Fingerprint {
    let tokens = significant_tokens(body, opts);
    let digest = hex::encode(Sha256::digest(tokens.join(" ").as_bytes()));
    Fingerprint { digest, tokens }
}

/// Jaccard similarity of two sorted, deduplicated token slices.
///
/// Returns 0.0 when both are empty.
pub fn jaccard(a: &[String], b: &[String]) -> f64 {
    let (mut i, mut j, mut shared) = (0usize, 0usize, 0usize);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                shared += 1;
                i += 1;
                j += 1;
            }
        }
    }

    let union = a.len() + b.len() - shared;
    if union == 0 {
        0.0
    } else {
        shared as f64 / union as f64
    }
}
