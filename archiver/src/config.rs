//! Configuration for the archiver.
//!
//! Three layers feed a deposit, lowest priority first:
//!
//! 1. built-in defaults,
//! 2. an optional TOML config file (`[deposit]`, `[storage]`, `[log]`),
//! 3. per-batch settings from the command line or a batches file.
//!
//! They are merged into one fully typed [`DepositConfig`] per batch before
//! anything is read or sent.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::fingerprint::EtagCalculator;
use crate::utils::errors::{ArchiverError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub deposit: DepositDefaults,
    pub storage: StorageConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DepositDefaults {
    /// Multipart chunk size, e.g. "8MB" or "4GB"
    pub chunk_size: String,

    /// Storage class requested for every object
    pub storage_class: String,

    /// Maximum concurrent part transfers per object
    pub max_concurrency: usize,

    /// Where results and transfer logs go; relative paths are resolved
    /// against the manifest's directory
    pub log_dir: PathBuf,

    /// Batch statistics, one row per batch
    pub stats_file: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory of the filesystem object store
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

// Default values
fn default_chunk_size() -> String {
    "4GB".to_string()
}

fn default_storage_class() -> String {
    "DEEP_ARCHIVE".to_string()
}

fn default_max_concurrency() -> usize {
    10
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_stats_file() -> PathBuf {
    PathBuf::from("stats.csv")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DepositDefaults {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            storage_class: default_storage_class(),
            max_concurrency: default_max_concurrency(),
            log_dir: default_log_dir(),
            stats_file: default_stats_file(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ArchiverError::Config(format!("Cannot read config file {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Parses a chunk size such as `8MB` into bytes.
///
/// Accepts a positive integer followed by `KB`, `MB` or `GB`, in any case.
/// Multiples are binary.
pub fn parse_chunk_size(value: &str) -> Result<u64> {
    let invalid = || {
        ArchiverError::Config(format!(
            "Invalid chunk size {:?}: expected a positive integer followed by KB, MB or GB",
            value
        ))
    };

    let trimmed = value.trim();
    if trimmed.len() < 3 || !trimmed.is_char_boundary(trimmed.len() - 2) {
        return Err(invalid());
    }
    let (digits, unit) = trimmed.split_at(trimmed.len() - 2);
    let multiplier: u64 = match unit.to_ascii_uppercase().as_str() {
        "KB" => 1 << 10,
        "MB" => 1 << 20,
        "GB" => 1 << 30,
        _ => return Err(invalid()),
    };
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let count: u64 = digits.parse().map_err(|_| invalid())?;
    if count == 0 {
        return Err(invalid());
    }
    count.checked_mul(multiplier).ok_or_else(invalid)
}

/// One batch as written on the command line or in a batches file.
///
/// Unset fields inherit the config file's `[deposit]` defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchSpec {
    pub bucket: String,
    /// Manifest file listing the assets
    #[serde(default, alias = "mapfile")]
    pub manifest: Option<PathBuf>,
    /// A single file to deposit instead of a manifest
    #[serde(default)]
    pub asset: Option<PathBuf>,
    #[serde(default, alias = "root")]
    pub asset_root: Option<PathBuf>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub chunk_size: Option<String>,
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub etag_expected: bool,
    #[serde(default)]
    pub dry_run: bool,
}

/// Contents of a `batch-deposit` file: one `[[batch]]` table per batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchesFile {
    #[serde(rename = "batch", default)]
    pub batches: Vec<BatchSpec>,
}

impl BatchesFile {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ArchiverError::Config(format!("Cannot read batches file {}: {}", path.display(), e))
        })?;
        let file: BatchesFile = toml::from_str(&content)?;
        if file.batches.is_empty() {
            return Err(ArchiverError::Config(format!(
                "Batches file {} defines no [[batch]] tables",
                path.display()
            )));
        }
        Ok(file)
    }
}

/// Where a batch's assets come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetSource {
    Manifest(PathBuf),
    SingleAsset(PathBuf),
}

/// Fully resolved settings for one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct DepositConfig {
    pub bucket: String,
    pub source: AssetSource,
    pub asset_root: Option<PathBuf>,
    pub name: Option<String>,
    /// As given, for display
    pub chunk_size: String,
    pub chunk_bytes: u64,
    pub storage_class: String,
    pub max_concurrency: usize,
    pub log_dir: PathBuf,
    pub dry_run: bool,
    pub etag_expected: bool,
    pub storage_root: Option<PathBuf>,
}

impl DepositConfig {
    /// Merges `spec` over `config`, validating everything a deposit needs.
    pub fn resolve(spec: &BatchSpec, config: &Config) -> Result<Self> {
        if spec.bucket.trim().is_empty() {
            return Err(ArchiverError::Config("A destination bucket is required".to_string()));
        }

        let source = match (&spec.manifest, &spec.asset) {
            (Some(manifest), None) => AssetSource::Manifest(manifest.clone()),
            (None, Some(asset)) => AssetSource::SingleAsset(asset.clone()),
            (Some(_), Some(_)) => {
                return Err(ArchiverError::Config(format!(
                    "Batch for bucket {} names both a manifest and a single asset",
                    spec.bucket
                )))
            }
            (None, None) => {
                return Err(ArchiverError::Config(format!(
                    "Batch for bucket {} names neither a manifest nor an asset",
                    spec.bucket
                )))
            }
        };

        let chunk_size = spec
            .chunk_size
            .clone()
            .unwrap_or_else(|| config.deposit.chunk_size.clone());
        let chunk_bytes = parse_chunk_size(&chunk_size)?;
        // Reject misaligned chunk sizes before any asset is touched
        EtagCalculator::new(chunk_bytes)?;

        let max_concurrency = spec.max_concurrency.unwrap_or(config.deposit.max_concurrency);
        if max_concurrency == 0 {
            return Err(ArchiverError::Config(
                "Maximum concurrency must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            bucket: spec.bucket.clone(),
            source,
            asset_root: spec.asset_root.clone(),
            name: spec.name.clone().filter(|n| !n.is_empty()),
            chunk_size,
            chunk_bytes,
            storage_class: spec
                .storage_class
                .clone()
                .unwrap_or_else(|| config.deposit.storage_class.clone()),
            max_concurrency,
            log_dir: spec
                .log_dir
                .clone()
                .unwrap_or_else(|| config.deposit.log_dir.clone()),
            dry_run: spec.dry_run,
            etag_expected: spec.etag_expected,
            storage_root: config.storage.root.clone(),
        })
    }

    pub fn manifest_path(&self) -> Option<&Path> {
        match &self.source {
            AssetSource::Manifest(path) => Some(path),
            AssetSource::SingleAsset(_) => None,
        }
    }
}
