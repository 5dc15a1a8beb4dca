//! # Digest Store Core
//!
//! Pure logic shared by Digest Store: URL normalization, content IDs,
//! significant-token fingerprints, Jaccard similarity, and the small set of
//! enums that describe a stored record.
//!
//! This crate performs no filesystem or network I/O.

pub mod identity;
pub mod models;

pub use identity::{
    compute_content_id, compute_fingerprint, jaccard, normalize_url, url_hash, Fingerprint,
    IdentityError, NormalizeOptions, TokenOptions, DEFAULT_TRACKING_PARAMS,
};
pub use models::{SourceType, Status, StoreOutcome};
