use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use digest_store_core::{NormalizeOptions, TokenOptions};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    #[serde(default = "default_ttl_days")]
    pub ttl_days: i64,
}

/// Upper bound for day-count settings, about a century.
pub const MAX_DAYS: i64 = 36_500;

fn default_ttl_days() -> i64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
    #[serde(default = "default_min_token_length")]
    pub min_token_length: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub extra_tracking_params: Vec<String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            lookback_days: default_lookback_days(),
            min_token_length: default_min_token_length(),
            max_tokens: default_max_tokens(),
            extra_tracking_params: Vec::new(),
        }
    }
}

fn default_similarity_threshold() -> f64 {
    0.8
}
fn default_lookback_days() -> i64 {
    30
}
fn default_min_token_length() -> usize {
    4
}
fn default_max_tokens() -> usize {
    1000
}

impl DedupConfig {
    pub fn token_options(&self) -> TokenOptions {
        TokenOptions {
            min_length: self.min_token_length,
            max_tokens: self.max_tokens,
        }
    }

    pub fn normalize_options(&self) -> NormalizeOptions {
        NormalizeOptions::with_extra(&self.extra_tracking_params)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// A config with defaults everywhere except the data directory.
    pub fn minimal(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig {
                data_dir: data_dir.into(),
                ttl_days: default_ttl_days(),
            },
            dedup: DedupConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.data_dir.as_os_str().is_empty() {
            anyhow::bail!("storage.data_dir must not be empty");
        }
        if !(1..=MAX_DAYS).contains(&self.storage.ttl_days) {
            anyhow::bail!("storage.ttl_days must be in 1..={}", MAX_DAYS);
        }

        let threshold = self.dedup.similarity_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            anyhow::bail!("dedup.similarity_threshold must be in (0.0, 1.0]");
        }
        if !(1..=MAX_DAYS).contains(&self.dedup.lookback_days) {
            anyhow::bail!("dedup.lookback_days must be in 1..={}", MAX_DAYS);
        }
        if self.dedup.min_token_length == 0 {
            anyhow::bail!("dedup.min_token_length must be > 0");
        }
        if self.dedup.max_tokens == 0 {
            anyhow::bail!("dedup.max_tokens must be > 0");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_defaults_applied() {
        let config = parse("[storage]\ndata_dir = \"./data\"\n").unwrap();
        assert_eq!(config.storage.ttl_days, 60);
        assert_eq!(config.dedup.similarity_threshold, 0.8);
        assert_eq!(config.dedup.lookback_days, 30);
        assert_eq!(config.dedup.min_token_length, 4);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_extra_tracking_params() {
        let config = parse(
            "[storage]\ndata_dir = \"d\"\n[dedup]\nextra_tracking_params = [\"spm\"]\n",
        )
        .unwrap();
        assert!(config
            .dedup
            .normalize_options()
            .tracking_params
            .contains("spm"));
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let err = parse("[storage]\ndata_dir = \"d\"\n[dedup]\nsimilarity_threshold = 1.5\n")
            .unwrap_err();
        assert!(err.to_string().contains("similarity_threshold"));

        assert!(parse("[storage]\ndata_dir = \"d\"\n[dedup]\nsimilarity_threshold = 0.0\n")
            .is_err());
    }

    #[test]
    fn test_day_settings_bounded() {
        assert!(parse("[storage]\ndata_dir = \"d\"\n[dedup]\nlookback_days = 0\n").is_err());
        let err = parse("[storage]\ndata_dir = \"d\"\n[dedup]\nlookback_days = 9000000000000000\n")
            .unwrap_err();
        assert!(err.to_string().contains("lookback_days"));
        assert!(parse("[storage]\ndata_dir = \"d\"\nttl_days = -5\n").is_err());
        assert!(parse("[storage]\ndata_dir = \"d\"\nttl_days = 36500\n").is_ok());
    }

    #[test]
    fn test_missing_storage_section_rejected() {
        assert!(parse("[dedup]\nlookback_days = 3\n").is_err());
    }
}
