//! Atomic file replacement.
//!
//! Every persisted byte in the store goes through [`write_atomic`]: the data
//! is written to a hidden temp file in the destination directory, flushed to
//! stable storage, then renamed over the destination. Observers see either
//! the previous file or the complete new one.
//!
//! A temp file that never reaches the rename (error, cancellation, crash) is
//! not linked anywhere. Dropped handles delete it immediately; files left by
//! a crashed process are removed by [`sweep_orphans`].

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{Result, StoreError};
use crate::paths::ensure_parent;

pub const TEMP_PREFIX: &str = ".tmp-";
pub const TEMP_SUFFIX: &str = ".partial";

/// A fully written and synced temp file that has not yet replaced its
/// destination. Dropping it discards the temp file.
#[derive(Debug)]
pub struct StagedWrite {
    temp: NamedTempFile,
    dest: std::path::PathBuf,
}

impl StagedWrite {
    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    /// Rename the temp file over the destination.
    pub fn commit(self) -> Result<()> {
        let dest = self.dest;
        self.temp
            .persist(&dest)
            .map_err(|e| StoreError::write_failed(&dest, e.error))?;
        if let Some(dir) = dest.parent() {
            sync_dir(dir);
        }
        Ok(())
    }
}

/// First half of [`write_atomic`]: write and fsync `bytes` next to `path`.
pub fn stage_atomic(path: &Path, bytes: &[u8]) -> Result<StagedWrite> {
    ensure_parent(path).map_err(|e| StoreError::write_failed(path, e))?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)
        .map_err(|e| StoreError::write_failed(path, e))?;

    temp.write_all(bytes)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| StoreError::write_failed(path, e))?;

    Ok(StagedWrite {
        temp,
        dest: path.to_path_buf(),
    })
}

/// Atomically replace `path` with `bytes`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    stage_atomic(path, bytes)?.commit()?;
    debug!(path = %path.display(), bytes = bytes.len(), "atomic write committed");
    Ok(())
}

/// Read-modify-write of a UTF-8 file under the same temp + rename
/// discipline. The mutator receives the current contents and returns the
/// replacement.
pub fn update_atomic<F>(path: &Path, mutate: F) -> Result<()>
where
    F: FnOnce(&str) -> Result<String>,
{
    let current = fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => StoreError::NotFound(path.display().to_string()),
        _ => StoreError::Io(e),
    })?;
    let updated = mutate(&current)?;
    write_atomic(path, updated.as_bytes())
}

pub fn is_temp_file(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX)
}

/// Delete temp files under `root` that are older than `min_age`. Returns the
/// number removed.
pub fn sweep_orphans(root: &Path, min_age: Duration) -> Result<usize> {
    if !root.exists() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut removed = 0;

    for entry in WalkDir::new(root).max_depth(3) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("skipping unreadable entry during temp sweep: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_temp_file(&entry.file_name().to_string_lossy()) {
            continue;
        }

        let age = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < min_age {
            continue;
        }

        match fs::remove_file(entry.path()) {
            Ok(()) => {
                removed += 1;
                debug!(path = %entry.path().display(), "removed orphaned temp file");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::Io(e)),
        }
    }

    Ok(removed)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
        debug!(dir = %dir.display(), "directory fsync failed: {}", e);
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_files(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| is_temp_file(n))
            .collect()
    }

    #[test]
    fn test_write_creates_parents_and_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ab").join("abc").join("html.md");
        write_atomic(&path, b"hello").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");
        assert!(temp_files(path.parent().unwrap()).is_empty());
    }

    #[test]
    fn test_overwrite_replaces_whole_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("f.md");
        write_atomic(&path, b"a much longer first version").unwrap();
        write_atomic(&path, b"short").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "short");
    }

    #[test]
    fn test_dropped_stage_leaves_prior_state() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("f.md");
        write_atomic(&path, b"original").unwrap();

        let staged = stage_atomic(&path, b"replacement that never lands").unwrap();
        assert!(staged.temp_path().exists());
        drop(staged);

        assert_eq!(fs::read_to_string(&path).unwrap(), "original");
        assert!(temp_files(tmp.path()).is_empty());
    }

    #[test]
    fn test_crash_before_rename_leaves_destination_absent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("new.md");

        // A crash skips destructors: the temp file stays behind unlinked.
        let staged = stage_atomic(&path, b"partial").unwrap();
        std::mem::forget(staged);

        assert!(!path.exists());
        assert_eq!(temp_files(tmp.path()).len(), 1);

        assert_eq!(sweep_orphans(tmp.path(), Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(sweep_orphans(tmp.path(), Duration::ZERO).unwrap(), 1);
        assert!(temp_files(tmp.path()).is_empty());
    }

    #[test]
    fn test_update_atomic() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("f.md");
        write_atomic(&path, b"count=1").unwrap();
        update_atomic(&path, |s| Ok(s.replace('1', "2"))).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "count=2");
    }

    #[test]
    fn test_update_atomic_failed_mutator_keeps_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("f.md");
        write_atomic(&path, b"stable").unwrap();
        let err = update_atomic(&path, |_| Err(StoreError::IndexCorruption("boom".into())));
        assert!(err.is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "stable");
    }

    #[test]
    fn test_update_missing_file_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let err = update_atomic(&tmp.path().join("nope.md"), |s| Ok(s.to_string())).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
