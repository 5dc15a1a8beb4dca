//! # Digest Store CLI (`dstore`)
//!
//! The `dstore` binary drives a digest store: it ingests content from files,
//! reads and lists records, updates their status, and maintains the
//! dedup indexes.
//!
//! ## Usage
//!
//! ```bash
//! dstore --config ./config/dstore.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dstore init` | Create the data directory and build the indexes |
//! | `dstore ingest <url> --file <path>` | Standardise and store one item |
//! | `dstore import <manifest>` | Ingest `url<TAB>path` lines concurrently |
//! | `dstore get <id>` | Print a record |
//! | `dstore list` | List records, optionally by age and status |
//! | `dstore mark <id> --status <s>` | Update a record's status |
//! | `dstore cleanup` | Delete records older than the retention period |
//! | `dstore rebuild` | Rebuild the indexes from the records |
//! | `dstore verify` | Check the indexes against the records, heal on mismatch |
//! | `dstore stats` | Summary of the store |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use digest_store::config::{self, Config};
use digest_store::ingest::{self, IngestRequest};
use digest_store::storage::{MetadataUpdate, StorageManager, StoreSettings};
use digest_store::{SourceType, Status};

/// Digest Store CLI: a content-addressed, deduplicating store for ingested
/// web pages, PDFs and YouTube transcripts.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/dstore.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "dstore",
    about = "Digest Store — a content-addressed, deduplicating content store",
    version,
    long_about = "Digest Store keeps ingested content as Markdown records with YAML front matter \
    under content-addressed paths, and rejects repeats by normalized URL or by content \
    fingerprint similarity before anything is written."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/dstore.toml`.
    #[arg(long, global = true, default_value = "./config/dstore.toml")]
    config: PathBuf,

    /// Increase log verbosity (`-v` debug, `-vv` trace). `RUST_LOG` wins
    /// when set.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Create the data directory and build the indexes.
    ///
    /// Idempotent: running it on an existing store rebuilds the indexes from
    /// the records on disk.
    Init,

    /// Standardise a fetched file and store it.
    ///
    /// Prints the outcome (`created`, `duplicate_url`, `duplicate_content`)
    /// and the content ID.
    Ingest {
        /// Source URL the content was fetched from.
        url: String,

        /// File holding the raw fetched bytes.
        #[arg(long)]
        file: PathBuf,

        /// Source type (`html`, `pdf`, `youtube`). Detected from the URL
        /// when omitted.
        #[arg(long)]
        source_type: Option<SourceType>,

        /// Title override.
        #[arg(long)]
        title: Option<String>,
    },

    /// Ingest every `url<TAB>path[<TAB>source_type]` line of a manifest.
    ///
    /// Relative paths are resolved against the manifest's directory.
    Import {
        /// Manifest file.
        manifest: PathBuf,

        /// Maximum concurrent ingests.
        #[arg(long, default_value = "4")]
        jobs: usize,
    },

    /// Print a record's metadata and body.
    Get {
        /// Content ID.
        id: String,

        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List records.
    List {
        /// Only records added within the last N days.
        #[arg(long, value_parser = clap::value_parser!(i64).range(1..))]
        days: Option<i64>,

        /// Only records with this status (`pending`, `processed`, `failed`).
        #[arg(long)]
        status: Option<Status>,

        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Update a record's status.
    ///
    /// `processed` also stamps `processed_at`.
    Mark {
        /// Content ID.
        id: String,

        /// New status.
        #[arg(long)]
        status: Status,
    },

    /// Delete records older than N days.
    Cleanup {
        /// Retention in days. Defaults to `storage.ttl_days`.
        #[arg(long, value_parser = clap::value_parser!(i64).range(1..))]
        days: Option<i64>,
    },

    /// Rebuild the URL and fingerprint indexes from the records.
    Rebuild,

    /// Compare the indexes with the records and rebuild on mismatch.
    Verify,

    /// Show record counts by source type and status.
    Stats,
}

fn init_logging(cfg: &Config, verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match verbose {
            0 => cfg.logging.level.as_str(),
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(level)
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // `init` works without a config file, on `./data`.
    let cfg = match cli.command {
        Commands::Init if !cli.config.exists() => Config::minimal("./data"),
        _ => config::load_config(&cli.config)?,
    };
    init_logging(&cfg, cli.verbose);
    tracing::debug!(config = %cli.config.display(), "dstore starting");

    let store = StorageManager::open(StoreSettings::from_config(&cfg))
        .with_context(|| format!("Failed to open store at {}", cfg.storage.data_dir.display()))?;

    match cli.command {
        Commands::Init => {
            let report = store.rebuild_indexes()?;
            println!(
                "Store initialized at {} ({} records)",
                cfg.storage.data_dir.display(),
                report.records
            );
        }
        Commands::Ingest {
            url,
            file,
            source_type,
            title,
        } => {
            let request = IngestRequest {
                url,
                path: file,
                source_type,
                title,
            };
            let result = ingest::ingest_file(&store, &request)?;
            println!("{} {}", result.outcome, result.content_id);
        }
        Commands::Import { manifest, jobs } => {
            let text = std::fs::read_to_string(&manifest)
                .with_context(|| format!("Failed to read manifest: {}", manifest.display()))?;
            let base = manifest
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."));
            let requests = ingest::parse_manifest(&text, &base)?;

            let report = ingest::import_manifest(Arc::new(store), requests, jobs).await?;
            println!("import {}", manifest.display());
            println!("  items:             {}", report.total());
            println!("  created:           {}", report.created);
            println!("  duplicate url:     {}", report.duplicate_url);
            println!("  duplicate content: {}", report.duplicate_content);
            println!("  failed:            {}", report.failed.len());
            for (url, err) in &report.failed {
                println!("    {}: {}", url, err);
            }
            println!("ok");
        }
        Commands::Get { id, json } => {
            let record = store.get(&id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                let meta = &record.metadata;
                println!("--- Record ---");
                println!("id:           {}", meta.content_id);
                println!("url:          {}", meta.url);
                println!("normalized:   {}", meta.normalized_url);
                println!("source_type:  {}", meta.source_type);
                println!("title:        {}", meta.title.as_deref().unwrap_or("(none)"));
                println!("status:       {}", meta.status);
                println!("date_added:   {}", meta.date_added.to_rfc3339());
                if let Some(ts) = meta.processed_at {
                    println!("processed_at: {}", ts.to_rfc3339());
                }
                println!("fingerprint:  {}", meta.content_fingerprint);
                println!();
                println!("--- Body ---");
                print!("{}", record.body);
            }
        }
        Commands::List { days, status, json } => {
            let records = store.list(days, status)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No records.");
            } else {
                for meta in &records {
                    println!(
                        "{}  {:<8} {:<10} {}  {}",
                        meta.content_id,
                        meta.source_type.as_str(),
                        meta.status.as_str(),
                        meta.date_added.format("%Y-%m-%d"),
                        meta.title.as_deref().unwrap_or(&meta.url)
                    );
                }
                println!("{} record(s)", records.len());
            }
        }
        Commands::Mark { id, status } => {
            let meta = match status {
                Status::Processed => store.mark_processed(&id)?,
                other => store.update_metadata(&id, MetadataUpdate::status(other))?,
            };
            println!("{} {}", meta.content_id, meta.status);
        }
        Commands::Cleanup { days } => {
            let days = days.unwrap_or(cfg.storage.ttl_days);
            let report = store.cleanup_old(days)?;
            println!("cleanup (older than {} days)", days);
            println!("  records removed:       {}", report.removed.len());
            println!("  index entries removed: {}", report.index_entries_removed);
            println!("  temp files removed:    {}", report.temp_files_removed);
            println!("ok");
        }
        Commands::Rebuild => {
            let report = store.rebuild_indexes()?;
            println!("rebuild");
            println!("  records:             {}", report.records);
            println!("  url entries:         {}", report.url_entries);
            println!("  fingerprint entries: {}", report.fingerprint_entries);
            println!("ok");
        }
        Commands::Verify => {
            let report = store.verify_indexes()?;
            if report.is_consistent() {
                println!("indexes consistent");
            } else {
                println!("indexes repaired");
                println!("  missing url entries:         {}", report.missing_urls.len());
                println!(
                    "  missing fingerprint entries: {}",
                    report.missing_fingerprints.len()
                );
                println!("  dangling entries:            {}", report.dangling.len());
            }
        }
        Commands::Stats => {
            let stats = store.stats()?;
            println!("Digest Store — Stats");
            println!("====================");
            println!();
            println!("  Data dir:     {}", cfg.storage.data_dir.display());
            println!("  Records:      {}", stats.records);
            println!("  URL index:    {}", stats.url_entries);
            println!("  Fingerprints: {}", stats.fingerprint_entries);
            if let (Some(oldest), Some(newest)) = (stats.oldest, stats.newest) {
                println!("  Oldest:       {}", oldest.format("%Y-%m-%d %H:%M"));
                println!("  Newest:       {}", newest.format("%Y-%m-%d %H:%M"));
            }
            if !stats.by_source_type.is_empty() {
                println!();
                println!("  By source type:");
                for (source_type, count) in &stats.by_source_type {
                    println!("    {:<10} {:>6}", source_type, count);
                }
                println!();
                println!("  By status:");
                for (status, count) in &stats.by_status {
                    println!("    {:<10} {:>6}", status, count);
                }
            }
            println!();
        }
    }

    Ok(())
}
