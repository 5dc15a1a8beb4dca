//! Error taxonomy for the storage layer.
//!
//! "Not found" during dedup checks and listings is a normal negative result
//! and is encoded in return values (`Option`, empty `Vec`). Only malformed
//! input and genuine I/O failures surface as [`StoreError`].

use std::path::PathBuf;

use digest_store_core::IdentityError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The URL could not be parsed or is not http(s). Not retryable.
    #[error(transparent)]
    InvalidUrl(#[from] IdentityError),

    /// An atomic write failed. The destination is untouched and the whole
    /// `store()` call may be retried.
    #[error("write failed for {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("content not found: {0}")]
    NotFound(String),

    /// A caller-supplied metadata key collides with a front matter field.
    #[error("metadata key '{0}' is reserved")]
    ReservedKey(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The persisted index disagrees with the record tree. Healed by
    /// rebuilding; never fatal.
    #[error("index corruption: {0}")]
    IndexCorruption(String),

    #[error("malformed record {path}: {reason}")]
    MalformedRecord { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn write_failed(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::WriteFailed {
            path: path.into(),
            source,
        }
    }

    /// True for errors where retrying the same call can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::WriteFailed { .. } | StoreError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
