//! Content-addressed path layout.
//!
//! ```text
//! {data_dir}/{content_id[0:2]}/{content_id}/{source_type}.md
//! {data_dir}/.index/
//! ```
//!
//! The two-character prefix directory bounds fan-out. Resolution is pure;
//! [`ensure_parent`] is the only function here that touches the disk.

use std::io;
use std::path::{Path, PathBuf};

use digest_store_core::SourceType;

/// Name of the directory holding persisted indexes.
pub const INDEX_DIR_NAME: &str = ".index";

#[derive(Debug, Clone)]
pub struct PathResolver {
    data_dir: PathBuf,
}

impl PathResolver {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join(INDEX_DIR_NAME)
    }

    pub fn prefix_dir(&self, content_id: &str) -> PathBuf {
        self.data_dir.join(content_id.get(..2).unwrap_or(content_id))
    }

    pub fn record_dir(&self, content_id: &str) -> PathBuf {
        self.prefix_dir(content_id).join(content_id)
    }

    /// Location of the record file for `content_id`.
    pub fn resolve(&self, content_id: &str, source_type: SourceType) -> PathBuf {
        self.record_dir(content_id).join(source_type.file_name())
    }
}

/// Content IDs are hex digests; older stores used UUID-like names. Anything
/// that could escape the data directory is refused.
pub fn is_valid_content_id(content_id: &str) -> bool {
    content_id.len() >= 2
        && content_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Create the parent directory of `path` if needed. Safe under concurrent
/// callers.
pub fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}
