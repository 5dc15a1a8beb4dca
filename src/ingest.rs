//! Ingestion: raw file → processor → dedup store.
//!
//! Fetching is out of scope; callers hand over bytes already on disk,
//! either one at a time ([`ingest_file`]) or as a manifest of
//! `url<TAB>path[<TAB>source_type]` lines ([`import_manifest`]).
//!
//! Manifest imports run concurrently on the blocking pool. The store has no
//! global lock, so concurrent duplicates settle on the content ID.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};

use digest_store_core::{SourceType, StoreOutcome};

use crate::processor::{detect_source_type, processor_for};
use crate::storage::{NewContent, StorageManager, StoreResult};

/// One item to ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestRequest {
    pub url: String,
    pub path: PathBuf,
    /// Detected from the URL when absent.
    pub source_type: Option<SourceType>,
    pub title: Option<String>,
}

impl IngestRequest {
    pub fn new(url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            path: path.into(),
            source_type: None,
            title: None,
        }
    }
}

/// Standardise `raw` and store it.
pub fn ingest_bytes(
    store: &StorageManager,
    url: &str,
    raw: &[u8],
    source_type: Option<SourceType>,
    title: Option<String>,
) -> Result<StoreResult> {
    let source_type = source_type.unwrap_or_else(|| detect_source_type(url));
    let standardised = processor_for(source_type)
        .standardise(raw, url)
        .with_context(|| format!("failed to process {} as {}", url, source_type))?;

    let mut content = NewContent::new(source_type);
    if let Some(title) = title.or(standardised.title) {
        content = content.with_title(title);
    }

    Ok(store.store(url, &standardised.body, content)?)
}

/// Read `request.path` and ingest it.
pub fn ingest_file(store: &StorageManager, request: &IngestRequest) -> Result<StoreResult> {
    let raw = std::fs::read(&request.path)
        .with_context(|| format!("failed to read {}", request.path.display()))?;
    ingest_bytes(
        store,
        &request.url,
        &raw,
        request.source_type,
        request.title.clone(),
    )
}

/// Parse a manifest. Blank lines and `#` comments are skipped; relative
/// paths are resolved against `base_dir`.
pub fn parse_manifest(text: &str, base_dir: &Path) -> Result<Vec<IngestRequest>> {
    let mut requests = Vec::new();

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim_end();
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        if fields.len() < 2 || fields[0].is_empty() || fields[1].is_empty() {
            bail!(
                "manifest line {}: expected url<TAB>path[<TAB>source_type]",
                lineno + 1
            );
        }

        let path = Path::new(fields[1]);
        let mut request = IngestRequest::new(
            fields[0],
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                base_dir.join(path)
            },
        );
        if let Some(st) = fields.get(2).filter(|s| !s.is_empty()) {
            request.source_type = Some(
                st.parse::<SourceType>()
                    .map_err(|e| anyhow::anyhow!("manifest line {}: {}", lineno + 1, e))?,
            );
        }
        requests.push(request);
    }

    Ok(requests)
}

/// Per-outcome counts of a manifest import.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub created: usize,
    pub duplicate_url: usize,
    pub duplicate_content: usize,
    /// `(url, error)` for items that could not be ingested.
    pub failed: Vec<(String, String)>,
}

impl ImportReport {
    fn record(&mut self, url: String, result: Result<StoreResult>) {
        match result {
            Ok(res) => match res.outcome {
                StoreOutcome::Created => self.created += 1,
                StoreOutcome::DuplicateUrl => self.duplicate_url += 1,
                StoreOutcome::DuplicateContent => self.duplicate_content += 1,
            },
            Err(e) => {
                warn!(url = %url, "ingest failed: {:#}", e);
                self.failed.push((url, format!("{:#}", e)));
            }
        }
    }

    pub fn total(&self) -> usize {
        self.created + self.duplicate_url + self.duplicate_content + self.failed.len()
    }
}

/// Ingest every request with at most `jobs` in flight.
pub async fn import_manifest(
    store: Arc<StorageManager>,
    requests: Vec<IngestRequest>,
    jobs: usize,
) -> Result<ImportReport> {
    let jobs = jobs.max(1);
    let mut report = ImportReport::default();
    let mut tasks: JoinSet<(String, Result<StoreResult>)> = JoinSet::new();

    for request in requests {
        while tasks.len() >= jobs {
            if let Some(joined) = tasks.join_next().await {
                let (url, result) = joined.context("ingest task panicked")?;
                report.record(url, result);
            }
        }
        let store = Arc::clone(&store);
        tasks.spawn_blocking(move || {
            let result = ingest_file(&store, &request);
            (request.url, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let (url, result) = joined.context("ingest task panicked")?;
        report.record(url, result);
    }

    info!(
        created = report.created,
        duplicate_url = report.duplicate_url,
        duplicate_content = report.duplicate_content,
        failed = report.failed.len(),
        "import finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreSettings;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<StorageManager>) {
        let tmp = TempDir::new().unwrap();
        let store = StorageManager::open(StoreSettings::new(tmp.path().join("data"))).unwrap();
        (tmp, Arc::new(store))
    }

    #[test]
    fn test_parse_manifest() {
        let text = "# comment\n\nhttps://ex.com/a\tpages/a.html\n\
                    https://ex.com/t\t/abs/t.txt\tyoutube\n";
        let reqs = parse_manifest(text, Path::new("/base")).unwrap();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].path, PathBuf::from("/base/pages/a.html"));
        assert_eq!(reqs[0].source_type, None);
        assert_eq!(reqs[1].path, PathBuf::from("/abs/t.txt"));
        assert_eq!(reqs[1].source_type, Some(SourceType::Youtube));
    }

    #[test]
    fn test_parse_manifest_rejects_bad_lines() {
        let err = parse_manifest("https://ex.com/a\n", Path::new("/")).unwrap_err();
        assert!(err.to_string().contains("line 1"));
        let err = parse_manifest("https://ex.com/a\tx\tvideo\n", Path::new("/")).unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_ingest_file_html() {
        let (tmp, store) = setup();
        let page = tmp.path().join("a.html");
        fs::write(
            &page,
            "<html><head><title>Caching</title></head><body><p>Article body about caching</p></body></html>",
        )
        .unwrap();

        let res = ingest_file(&store, &IngestRequest::new("https://ex.com/a", &page)).unwrap();
        assert_eq!(res.outcome, StoreOutcome::Created);

        let record = store.get(&res.content_id).unwrap();
        assert_eq!(record.metadata.title.as_deref(), Some("Caching"));
        assert_eq!(record.metadata.source_type, SourceType::Html);
        assert_eq!(record.body, "# Caching\n\nArticle body about caching\n");
    }

    #[test]
    fn test_ingest_missing_file_fails() {
        let (tmp, store) = setup();
        let req = IngestRequest::new("https://ex.com/a", tmp.path().join("missing.html"));
        assert!(ingest_file(&store, &req).is_err());
    }

    #[tokio::test]
    async fn test_import_manifest_counts_outcomes() {
        let (tmp, store) = setup();
        let a = tmp.path().join("a.html");
        let b = tmp.path().join("b.html");
        fs::write(&a, "<h1>Storage</h1><p>Deduplicating content stores explained</p>").unwrap();
        fs::write(&b, "<h1>Gardening</h1><p>Tomatoes prefer sunny corners</p>").unwrap();

        let requests = vec![
            IngestRequest::new("https://ex.com/a", &a),
            IngestRequest::new("https://ex.com/b", &b),
            IngestRequest::new("https://ex.com/missing", tmp.path().join("nope.html")),
        ];
        let report = import_manifest(Arc::clone(&store), requests, 2).await.unwrap();
        assert_eq!(report.created, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.total(), 3);

        let again = vec![IngestRequest::new("https://ex.com/a?utm_source=feed", &a)];
        let report = import_manifest(store, again, 1).await.unwrap();
        assert_eq!(report.duplicate_url, 1);
    }
}
