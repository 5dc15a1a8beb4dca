//! Deduplication indexes: URL hash → content ID and fingerprint → content ID.
//!
//! The indexes are a derived cache over the record tree. They are persisted
//! as two JSON files under `{data_dir}/.index/` with [`write_atomic`], can be
//! discarded at any time, and are reconstructed by [`IndexStore::rebuild_from`]
//! from the records on disk.
//!
//! Fingerprint entries keep the significant-token set next to the digest so
//! that near-duplicates with a different digest can be found by Jaccard
//! similarity. That scan only considers entries added within a lookback
//! window, so once an entry falls out of the window its tokens are dropped
//! and only the digest is kept.
//!
//! Every mutation is a read-modify-write of the persisted snapshot under an
//! in-process lock: entries written by another process since the last load
//! are picked up instead of being overwritten.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use digest_store_core::{url_hash, Fingerprint};

use crate::atomic::write_atomic;
use crate::error::{Result, StoreError};

const URLS_FILE: &str = "urls.json";
const FINGERPRINTS_FILE: &str = "fingerprints.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintEntry {
    pub content_id: String,
    /// Empty once the entry is older than the token horizon.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tokens: Vec<String>,
    pub date_added: DateTime<Utc>,
}

/// What the index needs to know about one record.
#[derive(Debug, Clone)]
pub struct IndexRecord {
    pub content_id: String,
    pub url_hash: String,
    /// `None` for bodies without significant tokens.
    pub fingerprint: Option<Fingerprint>,
    pub date_added: DateTime<Utc>,
}

/// A fingerprint lookup hit.
#[derive(Debug, Clone, PartialEq)]
pub struct FingerprintMatch {
    pub content_id: String,
    pub similarity: f64,
    /// True when the digest matched exactly.
    pub exact: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct IndexState {
    urls: BTreeMap<String, String>,
    fingerprints: BTreeMap<String, FingerprintEntry>,
}

impl IndexState {
    /// Add a record's keys. Existing keys keep their mapping.
    fn add(&mut self, record: &IndexRecord) {
        let existing = self
            .urls
            .entry(record.url_hash.clone())
            .or_insert_with(|| record.content_id.clone());
        if *existing != record.content_id {
            debug!(
                url_hash = %record.url_hash,
                kept = %existing,
                skipped = %record.content_id,
                "url index key already mapped"
            );
        }

        if let Some(fp) = &record.fingerprint {
            self.fingerprints
                .entry(fp.digest.clone())
                .or_insert_with(|| FingerprintEntry {
                    content_id: record.content_id.clone(),
                    tokens: fp.tokens.clone(),
                    date_added: record.date_added,
                });
        }
    }

    fn remove_ids(&mut self, ids: &HashSet<String>) -> usize {
        let before = self.urls.len() + self.fingerprints.len();
        self.urls.retain(|_, id| !ids.contains(id));
        self.fingerprints.retain(|_, e| !ids.contains(&e.content_id));
        before - (self.urls.len() + self.fingerprints.len())
    }

    fn drop_tokens_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut dropped = 0;
        for entry in self.fingerprints.values_mut() {
            if entry.date_added < cutoff && !entry.tokens.is_empty() {
                entry.tokens = Vec::new();
                dropped += 1;
            }
        }
        dropped
    }

    /// Oldest record wins a shared key; ties go to the smaller content ID.
    fn from_records(records: &[IndexRecord]) -> Self {
        let mut ordered: Vec<&IndexRecord> = records.iter().collect();
        ordered.sort_by(|a, b| {
            a.date_added
                .cmp(&b.date_added)
                .then_with(|| a.content_id.cmp(&b.content_id))
        });

        let mut state = IndexState::default();
        for record in ordered {
            state.add(record);
        }
        state
    }
}

/// Differences between the index and the record tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexReport {
    /// Keys the records call for that are absent or mapped elsewhere.
    pub missing_urls: Vec<String>,
    pub missing_fingerprints: Vec<String>,
    /// Entries pointing at content IDs with no record on disk.
    pub dangling: Vec<String>,
}

impl IndexReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_urls.is_empty() && self.missing_fingerprints.is_empty() && self.dangling.is_empty()
    }

    pub fn problem_count(&self) -> usize {
        self.missing_urls.len() + self.missing_fingerprints.len() + self.dangling.len()
    }
}

pub struct IndexStore {
    dir: PathBuf,
    state: RwLock<IndexState>,
    write_lock: Mutex<()>,
    token_horizon_days: Option<i64>,
}

impl IndexStore {
    /// An empty index persisted under `dir`. Call [`IndexStore::load`] to
    /// read existing files.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            state: RwLock::new(IndexState::default()),
            write_lock: Mutex::new(()),
            token_horizon_days: None,
        }
    }

    /// Drop the token sets of entries older than `days` whenever the index
    /// is written. Match this to the lookback window.
    pub fn with_token_horizon(mut self, days: i64) -> Self {
        self.token_horizon_days = Some(days);
        self
    }

    fn prune_tokens(&self, state: &mut IndexState) {
        let cutoff = self
            .token_horizon_days
            .and_then(Duration::try_days)
            .and_then(|span| Utc::now().checked_sub_signed(span));
        if let Some(cutoff) = cutoff {
            let dropped = state.drop_tokens_before(cutoff);
            if dropped > 0 {
                debug!(dropped, "dropped token sets outside the lookback window");
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the persisted indexes.
    ///
    /// Returns `Ok(false)` when nothing has been persisted yet and
    /// [`StoreError::IndexCorruption`] when the files are partial or
    /// unreadable. Both mean the caller should rebuild.
    pub fn load(&self) -> Result<bool> {
        match self.read_snapshot()? {
            Some(snapshot) => {
                *self.state.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn read_snapshot(&self) -> Result<Option<IndexState>> {
        let urls_path = self.dir.join(URLS_FILE);
        let fps_path = self.dir.join(FINGERPRINTS_FILE);

        match (urls_path.exists(), fps_path.exists()) {
            (false, false) => return Ok(None),
            (true, true) => {}
            _ => {
                return Err(StoreError::IndexCorruption(format!(
                    "only one of {} / {} present in {}",
                    URLS_FILE,
                    FINGERPRINTS_FILE,
                    self.dir.display()
                )))
            }
        }

        let urls = read_json(&urls_path)?;
        let fingerprints = read_json(&fps_path)?;
        Ok(Some(IndexState { urls, fingerprints }))
    }

    fn persist(&self, state: &IndexState) -> Result<()> {
        write_atomic(
            &self.dir.join(URLS_FILE),
            &serde_json::to_vec_pretty(&state.urls)?,
        )?;
        write_atomic(
            &self.dir.join(FINGERPRINTS_FILE),
            &serde_json::to_vec(&state.fingerprints)?,
        )?;
        Ok(())
    }

    /// Apply `mutate` to the latest persisted snapshot, write it back and
    /// adopt it in memory.
    fn mutate<F, T>(&self, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut IndexState) -> T,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut snapshot = match self.read_snapshot() {
            Ok(Some(disk)) => {
                let mut merged = disk;
                let memory = self.state.read().unwrap_or_else(PoisonError::into_inner);
                for (k, v) in &memory.urls {
                    merged.urls.entry(k.clone()).or_insert_with(|| v.clone());
                }
                for (k, v) in &memory.fingerprints {
                    merged.fingerprints.entry(k.clone()).or_insert_with(|| v.clone());
                }
                merged
            }
            Ok(None) => self.state.read().unwrap_or_else(PoisonError::into_inner).clone(),
            Err(e) => {
                warn!("persisted index unreadable, writing from memory: {}", e);
                self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
            }
        };

        let out = mutate(&mut snapshot);
        self.prune_tokens(&mut snapshot);
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = snapshot.clone();
        self.persist(&snapshot)?;
        Ok(out)
    }

    pub fn lookup_url_hash(&self, hash: &str) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .urls
            .get(hash)
            .cloned()
    }

    pub fn lookup_by_url(&self, normalized_url: &str) -> Option<String> {
        self.lookup_url_hash(&url_hash(normalized_url))
    }

    /// Exact digest match, then the best Jaccard match at or above
    /// `threshold` among entries added at or after `since`.
    pub fn lookup_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
        threshold: f64,
        since: DateTime<Utc>,
    ) -> Option<FingerprintMatch> {
        if fingerprint.is_empty() {
            return None;
        }

        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);

        if let Some(entry) = state.fingerprints.get(&fingerprint.digest) {
            return Some(FingerprintMatch {
                content_id: entry.content_id.clone(),
                similarity: 1.0,
                exact: true,
            });
        }

        let mut best: Option<(&FingerprintEntry, f64)> = None;
        for entry in state.fingerprints.values() {
            if entry.date_added < since {
                continue;
            }
            let similarity = fingerprint.similarity(&entry.tokens);
            if similarity < threshold {
                continue;
            }
            let better = match best {
                None => true,
                Some((current, score)) => {
                    similarity > score
                        || (similarity == score && entry.date_added < current.date_added)
                }
            };
            if better {
                best = Some((entry, similarity));
            }
        }

        best.map(|(entry, similarity)| FingerprintMatch {
            content_id: entry.content_id.clone(),
            similarity,
            exact: false,
        })
    }

    /// Record both mappings for a newly stored record. Keys that are already
    /// mapped keep their existing content ID.
    pub fn insert(&self, record: &IndexRecord) -> Result<()> {
        self.mutate(|state| state.add(record))
    }

    /// Drop every entry pointing at one of `content_ids`. Returns the number
    /// of entries removed.
    pub fn remove(&self, content_ids: &HashSet<String>) -> Result<usize> {
        if content_ids.is_empty() {
            return Ok(0);
        }
        self.mutate(|state| state.remove_ids(content_ids))
    }

    /// Replace both indexes with the state implied by `records`.
    pub fn rebuild_from(&self, records: &[IndexRecord]) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut state = IndexState::from_records(records);
        self.prune_tokens(&mut state);
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state.clone();
        self.persist(&state)
    }

    /// Compare the in-memory index against what `records` imply.
    pub fn verify_against(&self, records: &[IndexRecord]) -> IndexReport {
        let expected = IndexState::from_records(records);
        let actual = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let live: HashSet<&str> = records.iter().map(|r| r.content_id.as_str()).collect();

        let mut report = IndexReport::default();
        for (key, id) in &expected.urls {
            if actual.urls.get(key) != Some(id) {
                report.missing_urls.push(key.clone());
            }
        }
        for (key, entry) in &expected.fingerprints {
            if actual.fingerprints.get(key).map(|e| &e.content_id) != Some(&entry.content_id) {
                report.missing_fingerprints.push(key.clone());
            }
        }
        for (key, id) in &actual.urls {
            if !live.contains(id.as_str()) {
                report.dangling.push(key.clone());
            }
        }
        for (key, entry) in &actual.fingerprints {
            if !live.contains(entry.content_id.as_str()) {
                report.dangling.push(key.clone());
            }
        }
        report
    }

    pub fn url_count(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).urls.len()
    }

    pub fn fingerprint_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .fingerprints
            .len()
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| {
        StoreError::IndexCorruption(format!("{} is not valid: {}", path.display(), e))
    })
}
