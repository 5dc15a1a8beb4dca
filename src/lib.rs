//! # Digest Store
//!
//! A content-addressed, deduplicating filesystem store for ingested web
//! pages, PDFs and YouTube transcripts.
//!
//! Every record is a Markdown file with YAML front matter, placed at a path
//! derived from its content ID. Two derived indexes (URL hash and content
//! fingerprint) answer "have we seen this before?" without scanning the
//! tree; both can be rebuilt from the records at any time.
//!
//! ## Architecture
//!
//! ```text
//! raw bytes ──▶ ┌───────────┐   ┌────────────────┐   ┌─────────────────────┐
//!               │ processor │──▶│ StorageManager │──▶│ {prefix}/{id}/*.md  │
//!               └───────────┘   └───────┬────────┘   └─────────────────────┘
//!                                       │
//!                                       ▼
//!                              ┌─────────────────┐
//!                              │ .index/*.json   │
//!                              │ url/fingerprint │
//!                              └─────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! dstore init
//! dstore ingest https://example.com/post --file post.html
//! dstore list --days 7
//! dstore mark <id> --status processed
//! dstore cleanup
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Storage error taxonomy |
//! | [`paths`] | Content-addressed path layout |
//! | [`atomic`] | Temp-file + rename writes, orphan sweep |
//! | [`record`] | Front matter record format |
//! | [`index`] | URL and fingerprint indexes |
//! | [`storage`] | Dedup protocol and record lifecycle |
//! | [`processor`] | HTML / PDF / YouTube standardisation |
//! | [`ingest`] | File and manifest ingestion |
//!
//! URL normalization, content IDs and fingerprints live in the
//! `digest-store-core` crate and are re-exported as [`identity`].

pub mod atomic;
pub mod config;
pub mod error;
pub mod index;
pub mod ingest;
pub mod paths;
pub mod processor;
pub mod record;
pub mod storage;

pub use digest_store_core::identity;
pub use digest_store_core::{SourceType, Status, StoreOutcome};
pub use error::StoreError;
pub use storage::{NewContent, StorageManager, StoreResult, StoreSettings};
