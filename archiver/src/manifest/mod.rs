//! Manifests: declarative listings of assets to deposit.
//!
//! The format of a manifest is decided once, from its first line, by
//! [`detect`]. Every variant yields [`AssetDescriptor`]s; [`Manifest::load`]
//! filters them against the results ledger so a deposit can be re-run after
//! an interruption without re-sending what already made it.

pub mod inventory;
pub mod md5sum;
pub mod patsy;

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::asset::{absolute_path, ManifestRow};
use crate::batch::Batch;
use crate::ledger::read_completed;
use crate::utils::errors::{ArchiverError, Result};

pub use inventory::InventoryManifest;
pub use md5sum::Md5SumManifest;
pub use patsy::PatsyManifest;

/// One asset as listed in a manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssetDescriptor {
    pub path: String,
    pub batch_name: Option<String>,
    pub md5: Option<String>,
    pub relpath: Option<String>,
    pub manifest_row: ManifestRow,
    pub etag: Option<String>,
}

impl AssetDescriptor {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Key used to match this descriptor against the results ledger.
    pub fn completion_key(&self) -> (String, String) {
        (self.md5.clone().unwrap_or_default(), self.path.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Md5Sum,
    Patsy,
    Inventory,
    SingleAsset,
}

impl std::fmt::Display for ManifestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ManifestKind::Md5Sum => "md5sum",
            ManifestKind::Patsy => "patsy",
            ManifestKind::Inventory => "inventory",
            ManifestKind::SingleAsset => "single-asset",
        };
        f.write_str(name)
    }
}

/// A manifest source in one of the supported encodings.
#[derive(Debug, Clone)]
pub enum Manifest {
    Md5Sum(Md5SumManifest),
    Patsy(PatsyManifest),
    Inventory(InventoryManifest),
    /// No manifest file: the caller adds exactly one asset itself.
    SingleAsset,
}

/// Picks the manifest variant for `source` by inspecting its first line.
///
/// Structured formats are tried before the checksum listing, which accepts
/// almost any text.
pub fn detect(source: Option<&Path>) -> Result<Manifest> {
    let Some(source) = source else {
        return Ok(Manifest::SingleAsset);
    };
    let path = absolute_path(source)?;
    let header = read_header(&path)?;

    let manifest = if inventory::matches_header(&header) {
        Manifest::Inventory(InventoryManifest::new(path))
    } else if patsy::matches_header(&header) {
        Manifest::Patsy(PatsyManifest::new(path))
    } else {
        Manifest::Md5Sum(Md5SumManifest::new(path))
    };
    debug!("Detected {} manifest: {}", manifest.kind(), source.display());
    Ok(manifest)
}

/// Column names from the first line of `path`.
fn read_header(path: &Path) -> Result<Vec<String>> {
    let mut first_line = String::new();
    let mut reader = BufReader::new(File::open(path)?);
    if reader.read_line(&mut first_line).is_err() {
        // Not UTF-8: certainly not a CSV header
        return Ok(Vec::new());
    }
    let first_line = first_line.trim_start_matches('\u{feff}').trim_end();

    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(first_line.as_bytes());
    let header = match csv_reader.records().next() {
        Some(Ok(record)) => record.iter().map(|c| c.trim().to_string()).collect(),
        _ => Vec::new(),
    };
    Ok(header)
}

/// Reads every record of a headed CSV file as ordered `(column, value)` rows.
pub(crate) fn read_csv_rows(path: &Path) -> Result<(Vec<String>, Vec<ManifestRow>)> {
    let mut reader = csv::ReaderBuilder::new().from_path(path)?;
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = headers
            .iter()
            .cloned()
            .zip(record.iter().map(str::to_string))
            .collect();
        rows.push(row);
    }
    Ok((headers, rows))
}

/// Value of `column` in `row`, if present.
pub(crate) fn column<'a>(row: &'a ManifestRow, column: &str) -> Option<&'a str> {
    row.iter().find(|(k, _)| k == column).map(|(_, v)| v.as_str())
}

impl Manifest {
    pub fn kind(&self) -> ManifestKind {
        match self {
            Manifest::Md5Sum(_) => ManifestKind::Md5Sum,
            Manifest::Patsy(_) => ManifestKind::Patsy,
            Manifest::Inventory(_) => ManifestKind::Inventory,
            Manifest::SingleAsset => ManifestKind::SingleAsset,
        }
    }

    /// The manifest file, if there is one.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Manifest::Md5Sum(m) => Some(m.path()),
            Manifest::Patsy(m) => Some(m.path()),
            Manifest::Inventory(m) => Some(m.path()),
            Manifest::SingleAsset => None,
        }
    }

    /// Directory relative log locations are resolved against.
    pub fn base_dir(&self) -> std::io::Result<PathBuf> {
        match self.path().and_then(Path::parent) {
            Some(dir) => Ok(dir.to_path_buf()),
            None => std::env::current_dir(),
        }
    }

    /// Batch name derived from the manifest's location: the name of the
    /// directory holding it.
    pub fn default_batch_name(&self) -> Option<String> {
        let dir = self.path()?.parent()?;
        dir.file_name().map(|n| n.to_string_lossy().into_owned())
    }

    /// All descriptors in manifest order, without resumability filtering.
    pub fn descriptors(&self, etag_expected: bool) -> Result<Vec<AssetDescriptor>> {
        match self {
            Manifest::Md5Sum(m) => m.descriptors(),
            Manifest::Patsy(m) => m.descriptors(),
            Manifest::Inventory(m) => m.descriptors(etag_expected),
            Manifest::SingleAsset => Ok(Vec::new()),
        }
    }

    /// Populates `batch` with every descriptor not already recorded as
    /// completed in the batch's results ledger.
    ///
    /// With `etag_expected`, manifests that carry a provider digest column
    /// hand it to the asset, and the deposit trusts it instead of
    /// recomputing the composite digest. Blocks on file I/O (assets without
    /// a listed MD5 are hashed here) and stops between assets once `cancel`
    /// fires.
    pub fn load(
        &self,
        batch: &mut Batch,
        etag_expected: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let completed = match &batch.results_path {
            Some(path) => read_completed(path)?,
            None => HashSet::new(),
        };
        let descriptors = self.descriptors(etag_expected)?;
        let listed = descriptors.len();

        for descriptor in descriptors {
            if cancel.is_cancelled() {
                return Err(ArchiverError::Interrupted);
            }
            if completed.contains(&descriptor.completion_key()) {
                batch.skip_completed(&descriptor);
            } else {
                batch.add_asset(descriptor);
            }
        }

        if listed > 0 {
            info!(
                "Loaded {} manifest: {} listed, {} to deposit, {} previously completed",
                self.kind(),
                listed,
                batch.contents.len(),
                completed.len()
            );
        }
        Ok(())
    }
}
