//! Inventory manifests: the fixed 12-column CSV produced by the preservation
//! inventory tooling, optionally followed by an `ETAG` column.

use std::path::{Path, PathBuf};

use super::{column, read_csv_rows, AssetDescriptor};
use crate::utils::errors::{ArchiverError, Result};

pub const HEADER: [&str; 12] = [
    "BATCH", "PATH", "DIRECTORY", "RELPATH", "FILENAME", "EXTENSION", "BYTES", "MTIME", "MODDATE",
    "MD5", "SHA1", "SHA256",
];

pub const ETAG_COLUMN: &str = "ETAG";

/// Exact, ordered match on the signature, with `ETAG` as the only
/// permitted extra column.
pub fn matches_header(header: &[String]) -> bool {
    let signature_matches = header.len() >= HEADER.len()
        && header.iter().zip(HEADER.iter()).all(|(h, expected)| h == expected);

    match &header[HEADER.len().min(header.len())..] {
        [] => signature_matches,
        [extra] => signature_matches && extra == ETAG_COLUMN,
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct InventoryManifest {
    path: PathBuf,
}

impl InventoryManifest {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// With `etag_expected`, each row's `ETAG` is passed on as the provider
    /// digest the deposit will check against.
    pub fn descriptors(&self, etag_expected: bool) -> Result<Vec<AssetDescriptor>> {
        let (headers, rows) = read_csv_rows(&self.path)?;
        if !matches_header(&headers) {
            return Err(ArchiverError::malformed(&self.path, "inventory header does not match"));
        }
        if etag_expected && !headers.iter().any(|h| h == ETAG_COLUMN) {
            return Err(ArchiverError::malformed(
                &self.path,
                "provider digests expected but there is no ETAG column",
            ));
        }

        let descriptors = rows
            .into_iter()
            .map(|row| {
                let etag = if etag_expected {
                    column(&row, ETAG_COLUMN).map(str::to_string)
                } else {
                    None
                };
                AssetDescriptor {
                    path: column(&row, "PATH").unwrap_or_default().to_string(),
                    batch_name: column(&row, "BATCH").map(str::to_string),
                    md5: column(&row, "MD5").map(str::to_string),
                    relpath: column(&row, "RELPATH").map(str::to_string),
                    etag,
                    manifest_row: row,
                }
            })
            .collect();
        Ok(descriptors)
    }
}
