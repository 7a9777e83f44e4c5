//! Patsy database exports: headed CSV with at least `md5`, `filepath` and
//! `relpath` columns. Every other column is carried through to the results
//! ledger.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::{column, read_csv_rows, AssetDescriptor};
use crate::utils::errors::{ArchiverError, Result};

pub const REQUIRED_COLUMNS: [&str; 3] = ["md5", "filepath", "relpath"];

pub fn matches_header(header: &[String]) -> bool {
    let columns: HashSet<&str> = header.iter().map(String::as_str).collect();
    REQUIRED_COLUMNS.iter().all(|c| columns.contains(c))
}

#[derive(Debug, Clone)]
pub struct PatsyManifest {
    path: PathBuf,
}

impl PatsyManifest {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn descriptors(&self) -> Result<Vec<AssetDescriptor>> {
        let (headers, rows) = read_csv_rows(&self.path)?;
        if !matches_header(&headers) {
            return Err(ArchiverError::malformed(
                &self.path,
                format!("missing one of the required columns {:?}", REQUIRED_COLUMNS),
            ));
        }

        let descriptors = rows
            .into_iter()
            .map(|row| AssetDescriptor {
                path: column(&row, "filepath").unwrap_or_default().to_string(),
                md5: column(&row, "md5").map(str::to_string),
                relpath: column(&row, "relpath").map(str::to_string),
                manifest_row: row,
                ..Default::default()
            })
            .collect();
        Ok(descriptors)
    }
}
