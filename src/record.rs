//! On-disk record format: YAML front matter followed by the Markdown body.
//!
//! ```text
//! ---
//! content_id: 3f9a...
//! url: https://example.com/a?utm_source=x
//! normalized_url: https://example.com/a
//! source_type: html
//! ...
//! ---
//!
//! <body>
//! ```
//!
//! The body is stored byte-for-byte; [`parse`] returns exactly what
//! [`render`] was given.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use digest_store_core::{SourceType, Status};

use crate::atomic::update_atomic;
use crate::error::{Result, StoreError};

/// Metadata persisted in a record's front matter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentMetadata {
    pub content_id: String,
    pub url: String,
    pub normalized_url: String,
    pub source_type: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(deserialize_with = "de_datetime")]
    pub date_added: DateTime<Utc>,
    pub url_hash: String,
    pub content_fingerprint: String,
    pub status: Status,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_opt_datetime"
    )]
    pub processed_at: Option<DateTime<Utc>>,
    /// Caller-supplied keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Front matter fields owned by [`ContentMetadata`]. `extra` is flattened
/// next to them, so none of these may appear as an extra key.
pub const RESERVED_KEYS: &[&str] = &[
    "content_id",
    "url",
    "normalized_url",
    "source_type",
    "title",
    "date_added",
    "url_hash",
    "content_fingerprint",
    "status",
    "processed_at",
];

/// Reject caller-supplied keys that would shadow a front matter field.
pub fn check_extra_keys(extra: &BTreeMap<String, serde_yaml::Value>) -> Result<()> {
    match extra.keys().find(|k| RESERVED_KEYS.contains(&k.as_str())) {
        Some(key) => Err(StoreError::ReservedKey(key.clone())),
        None => Ok(()),
    }
}

/// Accepts RFC 3339, naive ISO timestamps (read as UTC) and bare dates.
fn parse_flexible(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn de_datetime<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_flexible(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", raw)))
}

fn de_opt_datetime<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(raw) => parse_flexible(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", raw))),
    }
}

/// Serialize a record file.
pub fn render(meta: &ContentMetadata, body: &str) -> Result<String> {
    let yaml = serde_yaml::to_string(meta)?;
    Ok(format!("---\n{}---\n\n{}", yaml, body))
}

/// Split a record file into its YAML front matter and body.
fn split_front_matter(text: &str) -> std::result::Result<(&str, &str), String> {
    let rest = text
        .strip_prefix("---\n")
        .ok_or_else(|| "missing front matter".to_string())?;

    // The closing delimiter is a line containing only `---`.
    let (yaml, after) = if let Some(after) = rest.strip_prefix("---") {
        ("", after)
    } else {
        let end = rest
            .match_indices("\n---")
            .map(|(i, _)| i)
            .find(|&i| matches!(rest[i + 4..].chars().next(), None | Some('\n')))
            .ok_or_else(|| "unterminated front matter".to_string())?;
        (&rest[..end + 1], &rest[end + 4..])
    };

    let body = after.strip_prefix('\n').unwrap_or(after);
    let body = body.strip_prefix('\n').unwrap_or(body);
    Ok((yaml, body))
}

/// Parse a record file into metadata and body.
pub fn parse(text: &str) -> std::result::Result<(ContentMetadata, String), String> {
    let (yaml, body) = split_front_matter(text)?;
    let meta: ContentMetadata = serde_yaml::from_str(yaml).map_err(|e| e.to_string())?;
    Ok((meta, body.to_string()))
}

/// Read and parse the record at `path`.
pub fn read_record(path: &Path) -> Result<(ContentMetadata, String)> {
    let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => StoreError::NotFound(path.display().to_string()),
        _ => StoreError::Io(e),
    })?;
    parse(&text).map_err(|reason| StoreError::MalformedRecord {
        path: path.to_path_buf(),
        reason,
    })
}

/// Apply `mutate` to the metadata of the record at `path`, rewriting the
/// file atomically. The body is carried over unchanged.
pub fn update_metadata_atomic<F>(path: &Path, mutate: F) -> Result<ContentMetadata>
where
    F: FnOnce(&mut ContentMetadata),
{
    let mut updated = None;
    update_atomic(path, |text| {
        let (mut meta, body) = parse(text).map_err(|reason| StoreError::MalformedRecord {
            path: path.to_path_buf(),
            reason,
        })?;
        mutate(&mut meta);
        let rendered = render(&meta, &body)?;
        updated = Some(meta);
        Ok(rendered)
    })?;

    updated.ok_or_else(|| StoreError::MalformedRecord {
        path: path.to_path_buf(),
        reason: "metadata update produced no result".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::write_atomic;
    use chrono::TimeZone;

    fn sample() -> ContentMetadata {
        ContentMetadata {
            content_id: "ab".repeat(32),
            url: "https://ex.com/a?utm_source=x".to_string(),
            normalized_url: "https://ex.com/a".to_string(),
            source_type: SourceType::Html,
            title: Some("Caching: a primer".to_string()),
            date_added: Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap(),
            url_hash: "cd".repeat(32),
            content_fingerprint: "ef".repeat(32),
            status: Status::Pending,
            processed_at: None,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn test_render_then_parse_preserves_body_exactly() {
        let body = "\n# Heading\n\nSome text\n---\nnot front matter\n";
        let text = render(&sample(), body).unwrap();
        assert!(text.starts_with("---\ncontent_id: "));
        let (meta, parsed_body) = parse(&text).unwrap();
        assert_eq!(meta, sample());
        assert_eq!(parsed_body, body);
    }

    #[test]
    fn test_extra_keys_preserved() {
        let mut meta = sample();
        meta.extra.insert(
            "category".to_string(),
            serde_yaml::Value::String("infra".to_string()),
        );
        let (parsed, _) = parse(&render(&meta, "b").unwrap()).unwrap();
        assert_eq!(
            parsed.extra.get("category"),
            Some(&serde_yaml::Value::String("infra".to_string()))
        );
    }

    #[test]
    fn test_reserved_extra_keys_rejected() {
        let mut extra = BTreeMap::new();
        extra.insert("category".to_string(), serde_yaml::Value::Null);
        assert!(check_extra_keys(&extra).is_ok());

        for key in RESERVED_KEYS {
            let extra = BTreeMap::from([(key.to_string(), serde_yaml::Value::Null)]);
            assert!(matches!(
                check_extra_keys(&extra),
                Err(StoreError::ReservedKey(k)) if k == *key
            ));
        }

        // Every serialized field is covered.
        let mut meta = sample();
        meta.processed_at = Some(meta.date_added);
        let value = serde_yaml::to_value(&meta).unwrap();
        let mapping = value.as_mapping().unwrap();
        assert_eq!(mapping.len(), RESERVED_KEYS.len());
        for key in mapping.keys() {
            assert!(RESERVED_KEYS.contains(&key.as_str().unwrap()));
        }
    }

    #[test]
    fn test_legacy_front_matter() {
        let text = "---\ncontent_id: test-content-id\nurl: https://example.com\n\
                    normalized_url: https://example.com/\nsource_type: html\n\
                    date_added: '2025-01-02T03:04:05.123456'\nurl_hash: h\n\
                    content_fingerprint: f\nstatus: pending_ai\n---\n\n# Body";
        let (meta, body) = parse(text).unwrap();
        assert_eq!(meta.status, Status::Pending);
        assert_eq!(meta.date_added.date_naive().to_string(), "2025-01-02");
        assert_eq!(body, "# Body");
    }

    #[test]
    fn test_missing_front_matter_rejected() {
        assert!(parse("# just markdown").is_err());
        assert!(parse("---\ncontent_id: x\n").is_err());
    }

    #[test]
    fn test_update_metadata_atomic() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("html.md");
        write_atomic(&path, render(&sample(), "body").unwrap().as_bytes()).unwrap();

        let updated = update_metadata_atomic(&path, |m| m.status = Status::Processed).unwrap();
        assert_eq!(updated.status, Status::Processed);

        let (meta, body) = read_record(&path).unwrap();
        assert_eq!(meta.status, Status::Processed);
        assert_eq!(meta.content_id, sample().content_id);
        assert_eq!(body, "body");
    }
}
