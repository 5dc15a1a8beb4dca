//! Shared enums describing stored content.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Where a piece of content came from. Also names the record file
/// (`{source_type}.md`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Html,
    Pdf,
    Youtube,
}

impl SourceType {
    pub const ALL: [SourceType; 3] = [SourceType::Html, SourceType::Pdf, SourceType::Youtube];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Html => "html",
            SourceType::Pdf => "pdf",
            SourceType::Youtube => "youtube",
        }
    }

    /// Record file name for this source type.
    pub fn file_name(&self) -> String {
        format!("{}.md", self.as_str())
    }

    /// Inverse of [`SourceType::file_name`].
    pub fn from_file_name(name: &str) -> Option<SourceType> {
        name.strip_suffix(".md").and_then(|stem| stem.parse().ok())
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "html" => Ok(SourceType::Html),
            "pdf" => Ok(SourceType::Pdf),
            "youtube" => Ok(SourceType::Youtube),
            other => Err(format!(
                "unknown source type '{}'. Must be html, pdf, or youtube.",
                other
            )),
        }
    }
}

/// Processing lifecycle of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[serde(alias = "pending_ai")]
    Pending,
    Processed,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Processed => "processed",
            Status::Failed => "failed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" | "pending_ai" => Ok(Status::Pending),
            "processed" => Ok(Status::Processed),
            "failed" => Ok(Status::Failed),
            other => Err(format!(
                "unknown status '{}'. Must be pending, processed, or failed.",
                other
            )),
        }
    }
}

/// Result of a dedup decision in `store()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOutcome {
    Created,
    DuplicateUrl,
    DuplicateContent,
}

impl StoreOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOutcome::Created => "created",
            StoreOutcome::DuplicateUrl => "duplicate_url",
            StoreOutcome::DuplicateContent => "duplicate_content",
        }
    }

    pub fn is_duplicate(&self) -> bool {
        !matches!(self, StoreOutcome::Created)
    }
}

impl fmt::Display for StoreOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
