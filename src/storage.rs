//! Storage manager: the dedup decision protocol and record lifecycle.
//!
//! `store()` checks, in order:
//!
//! 1. the URL index (exact normalized URL) → [`StoreOutcome::DuplicateUrl`]
//! 2. the fingerprint index (exact digest, then Jaccard within the lookback
//!    window) → [`StoreOutcome::DuplicateContent`]
//! 3. otherwise writes the record atomically, indexes it, and reports
//!    [`StoreOutcome::Created`].
//!
//! There is no store-wide lock. The content ID is a digest of
//! `(normalized_url, body)`, so concurrent stores of the same input resolve
//! to the same path and both report `Created` with the same ID. The record
//! tree is authoritative; the indexes can always be rebuilt from it.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use digest_store_core::{
    compute_content_id, compute_fingerprint, normalize_url, url_hash, NormalizeOptions,
    SourceType, Status, StoreOutcome, TokenOptions,
};

use crate::atomic::{self, write_atomic};
use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::index::{IndexRecord, IndexReport, IndexStore};
use crate::paths::{is_valid_content_id, PathResolver};
use crate::record::{
    check_extra_keys, read_record, render, update_metadata_atomic, ContentMetadata,
};

/// Temp files younger than this may belong to an in-flight write.
const ORPHAN_MIN_AGE: StdDuration = StdDuration::from_secs(3600);
const TRASH_PREFIX: &str = ".trash-";
const UPDATE_LOCK_STRIPES: usize = 16;

/// Everything the storage manager needs to know, independent of how the
/// configuration was loaded.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub data_dir: PathBuf,
    pub similarity_threshold: f64,
    pub lookback_days: i64,
    pub token_options: TokenOptions,
    pub normalize_options: NormalizeOptions,
}

impl StoreSettings {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self::from_config(&Config::minimal(data_dir))
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            data_dir: config.storage.data_dir.clone(),
            similarity_threshold: config.dedup.similarity_threshold,
            lookback_days: config.dedup.lookback_days,
            token_options: config.dedup.token_options(),
            normalize_options: config.dedup.normalize_options(),
        }
    }
}

/// Caller-supplied metadata for a new record.
#[derive(Debug, Clone)]
pub struct NewContent {
    pub source_type: SourceType,
    pub title: Option<String>,
    pub status: Status,
    /// Defaults to the time of the store call.
    pub date_added: Option<DateTime<Utc>>,
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl NewContent {
    pub fn new(source_type: SourceType) -> Self {
        Self {
            source_type,
            title: None,
            status: Status::Pending,
            date_added: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn with_date_added(mut self, date_added: DateTime<Utc>) -> Self {
        self.date_added = Some(date_added);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_yaml::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreResult {
    pub content_id: String,
    pub outcome: StoreOutcome,
}

/// A record read back from disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentRecord {
    pub metadata: ContentMetadata,
    pub body: String,
}

/// Mutable metadata fields. Identity fields (`content_id`, URLs, hashes,
/// `date_added`) cannot be changed.
#[derive(Debug, Clone, Default)]
pub struct MetadataUpdate {
    pub status: Option<Status>,
    pub processed_at: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl MetadataUpdate {
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    fn apply(self, meta: &mut ContentMetadata) {
        if let Some(status) = self.status {
            meta.status = status;
        }
        if let Some(ts) = self.processed_at {
            meta.processed_at = Some(ts);
        }
        if let Some(title) = self.title {
            meta.title = Some(title);
        }
        meta.extra.extend(self.extra);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub index_entries_removed: usize,
    pub temp_files_removed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RebuildReport {
    pub records: usize,
    pub url_entries: usize,
    pub fingerprint_entries: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub records: usize,
    pub by_source_type: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub url_entries: usize,
    pub fingerprint_entries: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

struct ScannedRecord {
    metadata: ContentMetadata,
    body: String,
}

/// Handle to a store rooted at one data directory. Share it behind an `Arc`;
/// dropping it is the teardown.
pub struct StorageManager {
    settings: StoreSettings,
    paths: PathResolver,
    index: IndexStore,
    update_locks: Vec<Mutex<()>>,
}

impl StorageManager {
    /// Open (creating if needed) the store at `settings.data_dir`.
    ///
    /// Missing or unreadable indexes are rebuilt from the record tree.
    pub fn open(settings: StoreSettings) -> Result<Self> {
        fs::create_dir_all(&settings.data_dir)?;
        let paths = PathResolver::new(&settings.data_dir);
        let index = IndexStore::new(paths.index_dir()).with_token_horizon(settings.lookback_days);

        let manager = Self {
            settings,
            paths,
            index,
            update_locks: (0..UPDATE_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        };

        match manager.index.load() {
            Ok(true) => {
                debug!(
                    urls = manager.index.url_count(),
                    fingerprints = manager.index.fingerprint_count(),
                    "loaded dedup indexes"
                );
            }
            Ok(false) => {
                info!("no persisted indexes, building from records");
                manager.rebuild_indexes()?;
            }
            Err(e) => {
                warn!("{}; rebuilding from records", e);
                manager.rebuild_indexes()?;
            }
        }

        Ok(manager)
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn paths(&self) -> &PathResolver {
        &self.paths
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    /// Store `body` fetched from `url` unless it duplicates existing content.
    pub fn store(&self, url: &str, body: &str, content: NewContent) -> Result<StoreResult> {
        check_extra_keys(&content.extra)?;
        let since = days_ago(self.settings.lookback_days)?;
        let normalized = normalize_url(url, &self.settings.normalize_options)?;
        let hash = url_hash(&normalized);
        let fingerprint = compute_fingerprint(body, &self.settings.token_options);

        if let Some(existing) = self.index.lookup_url_hash(&hash) {
            if self.live_or_heal(&existing) {
                info!(content_id = %existing, url = %normalized, "duplicate URL");
                return Ok(StoreResult {
                    content_id: existing,
                    outcome: StoreOutcome::DuplicateUrl,
                });
            }
        }

        if let Some(hit) =
            self.index
                .lookup_by_fingerprint(&fingerprint, self.settings.similarity_threshold, since)
        {
            if self.live_or_heal(&hit.content_id) {
                info!(
                    content_id = %hit.content_id,
                    url = %normalized,
                    similarity = hit.similarity,
                    exact = hit.exact,
                    "duplicate content"
                );
                return Ok(StoreResult {
                    content_id: hit.content_id,
                    outcome: StoreOutcome::DuplicateContent,
                });
            }
        }

        let content_id = compute_content_id(&normalized, body);

        let date_added = match self.find_record(&content_id) {
            Some(existing_path) => {
                // Same (url, body) already on disk: a racing writer or a lost
                // index entry. Keep the record, re-index it.
                debug!(content_id = %content_id, "record already on disk, re-indexing");
                match read_record(&existing_path) {
                    Ok((meta, _)) => meta.date_added,
                    Err(e) => {
                        warn!(content_id = %content_id, "existing record unreadable: {}", e);
                        self.write_record(&content_id, &normalized, &hash, url, body, &fingerprint.digest, &content)?
                    }
                }
            }
            None => self.write_record(&content_id, &normalized, &hash, url, body, &fingerprint.digest, &content)?,
        };
        self.settle_source_type(&content_id);

        let record = IndexRecord {
            content_id: content_id.clone(),
            url_hash: hash,
            fingerprint: (!fingerprint.is_empty()).then_some(fingerprint),
            date_added,
        };
        if let Err(e) = self.index.insert(&record) {
            error!(content_id = %content_id, "index update failed, record is stored: {}", e);
        }

        info!(content_id = %content_id, url = %normalized, "stored new content");
        Ok(StoreResult {
            content_id,
            outcome: StoreOutcome::Created,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn write_record(
        &self,
        content_id: &str,
        normalized_url: &str,
        url_hash: &str,
        url: &str,
        body: &str,
        fingerprint: &str,
        content: &NewContent,
    ) -> Result<DateTime<Utc>> {
        let date_added = content.date_added.unwrap_or_else(Utc::now);
        let metadata = ContentMetadata {
            content_id: content_id.to_string(),
            url: url.to_string(),
            normalized_url: normalized_url.to_string(),
            source_type: content.source_type,
            title: content.title.clone(),
            date_added,
            url_hash: url_hash.to_string(),
            content_fingerprint: fingerprint.to_string(),
            status: content.status,
            processed_at: None,
            extra: content.extra.clone(),
        };

        let path = self.paths.resolve(content_id, content.source_type);
        write_atomic(&path, render(&metadata, body)?.as_bytes())?;
        Ok(date_added)
    }

    /// Keep a single record file per content ID. Racing first stores with
    /// different source types can both write; the first file in
    /// `SourceType::ALL` order is kept.
    fn settle_source_type(&self, content_id: &str) {
        let present: Vec<PathBuf> = SourceType::ALL
            .iter()
            .map(|st| self.paths.resolve(content_id, *st))
            .filter(|p| p.is_file())
            .collect();

        let Some((kept, rest)) = present.split_first() else {
            return;
        };
        for extra in rest {
            warn!(
                content_id = %content_id,
                kept = %kept.display(),
                removed = %extra.display(),
                "second source type for one content ID"
            );
            match fs::remove_file(extra) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %extra.display(), "failed to remove record: {}", e),
            }
        }
    }

    /// True if `content_id` still has a record. Otherwise drops its index
    /// entries so the caller can fall through to a fresh store.
    fn live_or_heal(&self, content_id: &str) -> bool {
        if self.find_record(content_id).is_some() {
            return true;
        }

        warn!(
            "{}",
            StoreError::IndexCorruption(format!("entry points at missing record {}", content_id))
        );
        if let Err(e) = self.index.remove(&HashSet::from([content_id.to_string()])) {
            error!(content_id = %content_id, "failed to drop dangling index entry: {}", e);
        }
        false
    }

    /// Path of the record file for `content_id`, whatever its source type.
    pub fn find_record(&self, content_id: &str) -> Option<PathBuf> {
        if !is_valid_content_id(content_id) {
            return None;
        }
        SourceType::ALL
            .iter()
            .map(|st| self.paths.resolve(content_id, *st))
            .find(|p| p.is_file())
    }

    /// Read a record's body and metadata.
    pub fn get(&self, content_id: &str) -> Result<ContentRecord> {
        let path = self
            .find_record(content_id)
            .ok_or_else(|| StoreError::NotFound(content_id.to_string()))?;
        let (metadata, body) = read_record(&path)?;
        Ok(ContentRecord { metadata, body })
    }

    pub fn get_metadata(&self, content_id: &str) -> Result<ContentMetadata> {
        self.get(content_id).map(|r| r.metadata)
    }

    /// Records added within the last `days` days (all records when `None`),
    /// optionally filtered by status. Ordered by content ID.
    pub fn list(&self, days: Option<i64>, status: Option<Status>) -> Result<Vec<ContentMetadata>> {
        let cutoff = days.map(days_ago).transpose()?;
        Ok(self
            .scan_records()?
            .into_iter()
            .map(|r| r.metadata)
            .filter(|m| cutoff.map(|c| m.date_added >= c).unwrap_or(true))
            .filter(|m| status.map(|s| m.status == s).unwrap_or(true))
            .collect())
    }

    /// Update mutable metadata fields of a record.
    pub fn update_metadata(
        &self,
        content_id: &str,
        update: MetadataUpdate,
    ) -> Result<ContentMetadata> {
        check_extra_keys(&update.extra)?;
        let _guard = self.update_lock(content_id);
        let path = self
            .find_record(content_id)
            .ok_or_else(|| StoreError::NotFound(content_id.to_string()))?;

        let updated = update_metadata_atomic(&path, |meta| update.apply(meta))?;
        debug!(content_id = %content_id, status = %updated.status, "metadata updated");
        Ok(updated)
    }

    /// Mark a record processed, stamping `processed_at`.
    pub fn mark_processed(&self, content_id: &str) -> Result<ContentMetadata> {
        self.update_metadata(
            content_id,
            MetadataUpdate {
                status: Some(Status::Processed),
                processed_at: Some(Utc::now()),
                ..Default::default()
            },
        )
    }

    fn update_lock(&self, content_id: &str) -> std::sync::MutexGuard<'_, ()> {
        let stripe = content_id.bytes().next().unwrap_or(0) as usize % self.update_locks.len();
        self.update_locks[stripe]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove records added more than `days` days ago.
    ///
    /// Index entries are dropped and persisted before any file is touched,
    /// so an interruption can leave an unindexed record (healed by
    /// `rebuild_indexes`) but never an entry pointing at a deleted file.
    pub fn cleanup_old(&self, days: i64) -> Result<CleanupReport> {
        let cutoff = days_ago(days)?;
        let expired: Vec<String> = self
            .scan_records()?
            .into_iter()
            .filter(|r| r.metadata.date_added < cutoff)
            .map(|r| r.metadata.content_id)
            .collect();

        let mut report = CleanupReport::default();
        let ids: HashSet<String> = expired.iter().cloned().collect();
        report.index_entries_removed = self.index.remove(&ids)?;

        for content_id in expired {
            match self.remove_record_dir(&content_id) {
                Ok(()) => report.removed.push(content_id),
                Err(e) => warn!(content_id = %content_id, "failed to delete record: {}", e),
            }
        }

        report.temp_files_removed = atomic::sweep_orphans(self.paths.data_dir(), ORPHAN_MIN_AGE)?;
        let trash = self.sweep_trash()?;

        info!(
            removed = report.removed.len(),
            temp_files = report.temp_files_removed,
            trash,
            days,
            "cleanup finished"
        );
        Ok(report)
    }

    /// Move the record directory aside in one rename, then delete it.
    fn remove_record_dir(&self, content_id: &str) -> Result<()> {
        let record_dir = self.paths.record_dir(content_id);
        let prefix_dir = self.paths.prefix_dir(content_id);
        let trash = prefix_dir.join(format!("{}{}", TRASH_PREFIX, content_id));

        match fs::rename(&record_dir, &trash) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::Io(e)),
        }
        fs::remove_dir_all(&trash)?;

        // Only succeeds once the prefix directory is empty.
        let _ = fs::remove_dir(&prefix_dir);
        debug!(content_id = %content_id, "record deleted");
        Ok(())
    }

    /// Finish deletions interrupted after the rename.
    fn sweep_trash(&self) -> Result<usize> {
        let trash: Vec<PathBuf> = WalkDir::new(self.paths.data_dir())
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_type().is_dir() && e.file_name().to_string_lossy().starts_with(TRASH_PREFIX)
            })
            .map(|e| e.into_path())
            .collect();

        for dir in &trash {
            debug!(path = %dir.display(), "removing leftover trash");
            fs::remove_dir_all(dir)?;
            if let Some(prefix_dir) = dir.parent() {
                let _ = fs::remove_dir(prefix_dir);
            }
        }
        Ok(trash.len())
    }

    /// Recompute both indexes from the records on disk.
    pub fn rebuild_indexes(&self) -> Result<RebuildReport> {
        let records = self.index_records()?;
        self.index.rebuild_from(&records)?;

        let report = RebuildReport {
            records: records.len(),
            url_entries: self.index.url_count(),
            fingerprint_entries: self.index.fingerprint_count(),
        };
        info!(
            records = report.records,
            urls = report.url_entries,
            fingerprints = report.fingerprint_entries,
            "rebuilt dedup indexes"
        );
        Ok(report)
    }

    /// Compare the indexes with the record tree and rebuild on mismatch.
    /// Returns what was found before healing.
    pub fn verify_indexes(&self) -> Result<IndexReport> {
        let records = self.index_records()?;
        let report = self.index.verify_against(&records);

        if !report.is_consistent() {
            warn!(
                "{}; rebuilding",
                StoreError::IndexCorruption(format!(
                    "{} missing url, {} missing fingerprint, {} dangling entries",
                    report.missing_urls.len(),
                    report.missing_fingerprints.len(),
                    report.dangling.len()
                ))
            );
            self.index.rebuild_from(&records)?;
        }
        Ok(report)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats {
            url_entries: self.index.url_count(),
            fingerprint_entries: self.index.fingerprint_count(),
            ..Default::default()
        };

        for record in self.scan_records()? {
            let meta = record.metadata;
            stats.records += 1;
            *stats
                .by_source_type
                .entry(meta.source_type.to_string())
                .or_default() += 1;
            *stats.by_status.entry(meta.status.to_string()).or_default() += 1;
            stats.oldest = Some(stats.oldest.map_or(meta.date_added, |o| o.min(meta.date_added)));
            stats.newest = Some(stats.newest.map_or(meta.date_added, |n| n.max(meta.date_added)));
        }
        Ok(stats)
    }

    fn index_records(&self) -> Result<Vec<IndexRecord>> {
        Ok(self
            .scan_records()?
            .into_iter()
            .map(|r| {
                let meta = r.metadata;
                let hash = normalize_url(&meta.url, &self.settings.normalize_options)
                    .map(|n| url_hash(&n))
                    .unwrap_or_else(|_| meta.url_hash.clone());
                let fingerprint = compute_fingerprint(&r.body, &self.settings.token_options);
                if fingerprint.digest != meta.content_fingerprint {
                    debug!(content_id = %meta.content_id, "stored fingerprint differs from recomputed");
                }
                IndexRecord {
                    content_id: meta.content_id,
                    url_hash: hash,
                    fingerprint: (!fingerprint.is_empty()).then_some(fingerprint),
                    date_added: meta.date_added,
                }
            })
            .collect())
    }

    /// Walk `{data_dir}/{prefix}/{content_id}/{source_type}.md`, skipping the
    /// index, temp files and anything that does not parse.
    fn scan_records(&self) -> Result<Vec<ScannedRecord>> {
        let mut records = Vec::new();

        let walker = WalkDir::new(self.paths.data_dir())
            .min_depth(3)
            .max_depth(3)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_record_path(entry.path()) {
                continue;
            }

            match read_record(entry.path()) {
                Ok((metadata, body)) => {
                    let dir_id = entry
                        .path()
                        .parent()
                        .and_then(|p| p.file_name())
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    if metadata.content_id != dir_id {
                        warn!(
                            path = %entry.path().display(),
                            "content_id does not match its directory, skipping"
                        );
                        continue;
                    }
                    records.push(ScannedRecord { metadata, body });
                }
                Err(e) => warn!("skipping record: {}", e),
            }
        }

        Ok(records)
    }
}

/// The instant `days` days before now. Spans too long to represent reach
/// back to the earliest representable time.
fn days_ago(days: i64) -> Result<DateTime<Utc>> {
    if days < 1 {
        return Err(StoreError::InvalidArgument(format!(
            "days must be >= 1, got {}",
            days
        )));
    }
    Ok(Duration::try_days(days)
        .and_then(|span| Utc::now().checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC))
}

/// `{prefix}/{content_id}/{source_type}.md` where the content ID starts with
/// its two-character prefix.
fn is_record_path(path: &Path) -> bool {
    let file_ok = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(SourceType::from_file_name)
        .is_some();

    let id_dir = path.parent();
    let prefix_dir = id_dir.and_then(|p| p.parent());
    match (
        id_dir.and_then(|p| p.file_name()).and_then(|n| n.to_str()),
        prefix_dir.and_then(|p| p.file_name()).and_then(|n| n.to_str()),
    ) {
        (Some(id), Some(prefix)) => {
            file_ok && prefix.len() == 2 && id.starts_with(prefix) && is_valid_content_id(id)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(tmp: &TempDir) -> StorageManager {
        StorageManager::open(StoreSettings::new(tmp.path())).unwrap()
    }

    fn html() -> NewContent {
        NewContent::new(SourceType::Html)
    }

    #[test]
    fn test_store_writes_record_at_resolved_path() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let res = store
            .store("https://ex.com/a", "Article body about caching", html().with_title("Caching"))
            .unwrap();
        assert_eq!(res.outcome, StoreOutcome::Created);

        let path = store.paths().resolve(&res.content_id, SourceType::Html);
        assert!(path.is_file());
        assert!(path.starts_with(tmp.path().join(&res.content_id[..2])));

        let record = store.get(&res.content_id).unwrap();
        assert_eq!(record.body, "Article body about caching");
        assert_eq!(record.metadata.title.as_deref(), Some("Caching"));
        assert_eq!(record.metadata.status, Status::Pending);
        assert_eq!(record.metadata.normalized_url, "https://ex.com/a");
    }

    #[test]
    fn test_invalid_url_rejected_without_write() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let err = store.store("not a url", "body text here", html()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidUrl(_)));
        assert!(store.list(None, None).unwrap().is_empty());
    }

    #[test]
    fn test_get_missing_and_invalid_ids() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        assert!(matches!(store.get("abcdef"), Err(StoreError::NotFound(_))));
        assert!(matches!(store.get("../../etc"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_empty_token_bodies_skip_content_dedup() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let a = store.store("https://ex.com/1", "a b c", html()).unwrap();
        let b = store.store("https://ex.com/2", "a b c", html()).unwrap();
        assert_eq!(a.outcome, StoreOutcome::Created);
        assert_eq!(b.outcome, StoreOutcome::Created);
        assert_ne!(a.content_id, b.content_id);
    }

    #[test]
    fn test_dangling_url_entry_is_healed() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let first = store.store("https://ex.com/a", "Article body about caching", html()).unwrap();
        fs::remove_dir_all(store.paths().record_dir(&first.content_id)).unwrap();

        let again = store.store("https://ex.com/a", "Article body about caching", html()).unwrap();
        assert_eq!(again.outcome, StoreOutcome::Created);
        assert_eq!(again.content_id, first.content_id);
        assert!(store.get(&again.content_id).is_ok());
    }

    #[test]
    fn test_existing_record_not_rewritten_when_index_lost() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let res = store.store("https://ex.com/a", "Article body about caching", html()).unwrap();
        store.mark_processed(&res.content_id).unwrap();

        fs::remove_dir_all(store.paths().index_dir()).unwrap();
        let fresh = StorageManager::new_without_index_for_tests(tmp.path());
        let again = fresh
            .store("https://ex.com/a", "Article body about caching", html())
            .unwrap();
        assert_eq!(again.outcome, StoreOutcome::Created);
        assert_eq!(again.content_id, res.content_id);
        assert_eq!(
            fresh.get_metadata(&res.content_id).unwrap().status,
            Status::Processed
        );
    }

    #[test]
    fn test_update_metadata_keeps_identity() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let res = store.store("https://ex.com/a", "Article body about caching", html()).unwrap();

        let updated = store
            .update_metadata(
                &res.content_id,
                MetadataUpdate {
                    status: Some(Status::Failed),
                    extra: BTreeMap::from([(
                        "error".to_string(),
                        serde_yaml::Value::String("timeout".to_string()),
                    )]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.status, Status::Failed);
        assert_eq!(updated.content_id, res.content_id);

        let record = store.get(&res.content_id).unwrap();
        assert_eq!(record.metadata.status, Status::Failed);
        assert_eq!(record.body, "Article body about caching");
        assert!(record.metadata.extra.contains_key("error"));

        assert!(matches!(
            store.update_metadata("ffff", MetadataUpdate::status(Status::Processed)),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_mark_processed_sets_timestamp() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let res = store.store("https://ex.com/a", "Article body about caching", html()).unwrap();
        let meta = store.mark_processed(&res.content_id).unwrap();
        assert_eq!(meta.status, Status::Processed);
        assert!(meta.processed_at.is_some());
        assert_eq!(store.list(Some(7), Some(Status::Processed)).unwrap().len(), 1);
        assert!(store.list(Some(7), Some(Status::Pending)).unwrap().is_empty());
    }

    #[test]
    fn test_list_and_cleanup_by_age() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let old = store
            .store(
                "https://ex.com/old",
                "Ancient history of databases",
                html().with_date_added(Utc::now() - Duration::days(90)),
            )
            .unwrap();
        let new = store
            .store("https://ex.com/new", "Fresh thoughts on compilers", html())
            .unwrap();

        assert_eq!(store.list(Some(7), None).unwrap().len(), 1);
        assert_eq!(store.list(None, None).unwrap().len(), 2);

        let report = store.cleanup_old(60).unwrap();
        assert_eq!(report.removed, vec![old.content_id.clone()]);
        assert!(report.index_entries_removed >= 2);
        assert!(matches!(store.get(&old.content_id), Err(StoreError::NotFound(_))));
        assert!(store.get(&new.content_id).is_ok());
        assert!(!store.paths().record_dir(&old.content_id).exists());
        assert_eq!(store.index().lookup_by_url("https://ex.com/old"), None);
        assert!(store.verify_indexes().unwrap().is_consistent());
    }

    #[test]
    fn test_scan_ignores_foreign_files() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        store.store("https://ex.com/a", "Article body about caching", html()).unwrap();

        fs::create_dir_all(tmp.path().join("zz").join("zz-notes")).unwrap();
        fs::write(tmp.path().join("zz").join("zz-notes").join("html.md"), "no front matter").unwrap();
        fs::create_dir_all(tmp.path().join("2024-01-01")).unwrap();
        fs::write(tmp.path().join("2024-01-01").join("html_abc.md"), "legacy").unwrap();

        assert_eq!(store.list(None, None).unwrap().len(), 1);
    }

    #[test]
    fn test_stats() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        store.store("https://ex.com/a", "Article body about caching", html()).unwrap();
        store
            .store(
                "https://youtu.be/xyz",
                "Transcript discussing orbital mechanics",
                NewContent::new(SourceType::Youtube),
            )
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.records, 2);
        assert_eq!(stats.by_source_type.get("youtube"), Some(&1));
        assert_eq!(stats.by_status.get("pending"), Some(&2));
        assert_eq!(stats.url_entries, 2);
        assert_eq!(stats.fingerprint_entries, 2);
    }

    #[test]
    fn test_reserved_extra_key_rejected_before_write() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let err = store
            .store(
                "https://ex.com/a",
                "Article body about caching",
                html().with_extra("status", serde_yaml::Value::String("processed".into())),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::ReservedKey(k) if k == "status"));
        assert!(store.list(None, None).unwrap().is_empty());
        assert_eq!(store.index().url_count(), 0);

        let again = store
            .store(
                "https://ex.com/a",
                "Article body about caching",
                html().with_extra("origin", serde_yaml::Value::String("feed".into())),
            )
            .unwrap();
        assert_eq!(again.outcome, StoreOutcome::Created);
        assert!(store.get(&again.content_id).unwrap().metadata.extra.contains_key("origin"));
    }

    #[test]
    fn test_reserved_key_in_update_leaves_record_readable() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let res = store.store("https://ex.com/a", "Article body about caching", html()).unwrap();

        let update = MetadataUpdate {
            status: Some(Status::Failed),
            extra: BTreeMap::from([(
                "content_id".to_string(),
                serde_yaml::Value::String("ff".repeat(32)),
            )]),
            ..Default::default()
        };
        assert!(matches!(
            store.update_metadata(&res.content_id, update),
            Err(StoreError::ReservedKey(_))
        ));

        let meta = store.get_metadata(&res.content_id).unwrap();
        assert_eq!(meta.status, Status::Pending);
        assert_eq!(store.list(None, None).unwrap().len(), 1);
    }

    #[test]
    fn test_day_arguments_validated() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let res = store.store("https://ex.com/a", "Article body about caching", html()).unwrap();

        for days in [-1, 0] {
            assert!(matches!(store.cleanup_old(days), Err(StoreError::InvalidArgument(_))));
            assert!(matches!(store.list(Some(days), None), Err(StoreError::InvalidArgument(_))));
        }
        assert!(store.get(&res.content_id).is_ok());

        // Spans past the representable range mean "since forever".
        let huge = i64::MAX / 1000;
        assert_eq!(store.list(Some(huge), None).unwrap().len(), 1);
        assert!(store.cleanup_old(huge).unwrap().removed.is_empty());
        assert!(store.get(&res.content_id).is_ok());
    }

    #[test]
    fn test_oversized_lookback_does_not_panic() {
        let tmp = TempDir::new().unwrap();
        let mut settings = StoreSettings::new(tmp.path());
        settings.lookback_days = i64::MAX;
        let store = StorageManager::open(settings).unwrap();

        store.store("https://ex.com/a", "Article body about caching", html()).unwrap();
        let near = store
            .store("https://ex.com/b", "Article body about caching systems", html())
            .unwrap();
        assert_eq!(near.outcome, StoreOutcome::DuplicateContent);
    }

    #[test]
    fn test_second_source_type_file_is_removed() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let res = store.store("https://ex.com/a", "Article body about caching", html()).unwrap();

        // What a racing store of the same bytes as a PDF leaves behind.
        let mut meta = store.get_metadata(&res.content_id).unwrap();
        meta.source_type = SourceType::Pdf;
        let pdf = store.paths().resolve(&res.content_id, SourceType::Pdf);
        write_atomic(&pdf, render(&meta, "Article body about caching").unwrap().as_bytes())
            .unwrap();
        assert_eq!(store.list(None, None).unwrap().len(), 2);

        store.settle_source_type(&res.content_id);
        assert!(!pdf.exists());
        assert!(store.paths().resolve(&res.content_id, SourceType::Html).is_file());
        assert_eq!(store.list(None, None).unwrap().len(), 1);
    }

    impl StorageManager {
        /// Opens without loading or rebuilding the index, as if it had been
        /// lost after open.
        fn new_without_index_for_tests(data_dir: &Path) -> Self {
            let paths = PathResolver::new(data_dir);
            Self {
                settings: StoreSettings::new(data_dir),
                index: IndexStore::new(paths.index_dir()),
                paths,
                update_locks: (0..UPDATE_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            }
        }
    }
}
