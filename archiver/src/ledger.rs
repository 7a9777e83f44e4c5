//! Persistent records of a deposit.
//!
//! - `results.csv`: one row per transmitted asset, read back on the next
//!   run to work out what is already done.
//! - `assets.jsonl`: the provider's response metadata for each transfer,
//!   one JSON object per line.
//! - the stats file: one row of [`BatchStats`] per batch.
//!
//! All three are append-only.

use serde::Serialize;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::warn;

use crate::batch::BatchStats;
use crate::utils::errors::Result;

/// Columns every results ledger carries, after `ID` and any manifest columns.
pub const RESULT_COLUMNS: [&str; 7] = [
    "MD5",
    "PATH",
    "KEYPATH",
    "ETAG",
    "RESULT",
    "STORAGEPROVIDER",
    "STORAGELOCATION",
];

pub const RESULT_SUCCESS: &str = "success";
pub const RESULT_FAILED: &str = "failed";
pub const RESULT_DRY_RUN: &str = "dry-run";

/// `(md5, path)` pairs the ledger at `path` records as deposited.
///
/// Only `success` rows count, so failed verifications and dry runs are
/// retried. A ledger without a `RESULT` column is taken at its word.
pub fn read_completed(path: &Path) -> Result<HashSet<(String, String)>> {
    let mut completed = HashSet::new();
    if !path.is_file() {
        return Ok(completed);
    }

    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers = reader.headers()?.clone();
    let index_of = |name: &str| headers.iter().position(|h| h == name);
    let (Some(md5_idx), Some(path_idx)) = (index_of("MD5"), index_of("PATH")) else {
        warn!("Results file {} has no MD5/PATH columns; nothing will be skipped", path.display());
        return Ok(completed);
    };
    let result_idx = index_of("RESULT");

    for record in reader.records() {
        let record = record?;
        if let Some(idx) = result_idx {
            if record.get(idx) != Some(RESULT_SUCCESS) {
                continue;
            }
        }
        let md5 = record.get(md5_idx).unwrap_or_default().to_string();
        let local_path = record.get(path_idx).unwrap_or_default().to_string();
        completed.insert((md5, local_path));
    }

    Ok(completed)
}

/// Appendable CSV of deposit results.
pub struct ResultsLedger {
    columns: Vec<String>,
    writer: csv::Writer<File>,
}

impl ResultsLedger {
    /// Column layout for a new ledger: `ID`, the manifest's own columns,
    /// then whichever of [`RESULT_COLUMNS`] the manifest did not supply.
    pub fn columns_for(manifest_row: &[(String, String)]) -> Vec<String> {
        let mut columns = vec!["ID".to_string()];
        for (key, _) in manifest_row {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
        for key in RESULT_COLUMNS {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.to_string());
            }
        }
        columns
    }

    /// Opens `path` for appending. A new (or empty) file gets a header row
    /// from `columns`; an existing ledger keeps its own header.
    pub fn open(path: &Path, columns: &[String]) -> Result<Self> {
        let has_header = path.is_file() && std::fs::metadata(path)?.len() > 0;

        let columns = if has_header {
            let mut reader = csv::ReaderBuilder::new().from_path(path)?;
            reader.headers()?.iter().map(str::to_string).collect()
        } else {
            columns.to_vec()
        };

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if !has_header {
            writer.write_record(&columns)?;
            writer.flush()?;
        }

        Ok(Self {
            columns,
            writer,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Writes one row. The first value given for a column wins; columns the
    /// ledger does not have are dropped, missing ones left empty.
    pub fn append(&mut self, values: &[(&str, &str)]) -> Result<()> {
        let record: Vec<&str> = self
            .columns
            .iter()
            .map(|column| {
                values
                    .iter()
                    .find(|(k, _)| k == column)
                    .map(|(_, v)| *v)
                    .unwrap_or_default()
            })
            .collect();
        self.writer.write_record(&record)?;
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Serialize)]
struct TransferRecord<'a> {
    asset: &'a str,
    response: &'a serde_json::Value,
}

/// Line-delimited JSON log of provider responses.
pub struct TransferLog {
    file: File,
}

impl TransferLog {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    /// Appends `{"asset": ..., "response": ...}` as a single line.
    pub fn record(&mut self, asset: &str, response: &serde_json::Value) -> Result<()> {
        let line = serde_json::to_string(&TransferRecord { asset, response })?;
        writeln!(self.file, "{}", line)?;
        self.file.flush()?;
        Ok(())
    }
}

/// Appends one stats row, writing the header first if the file is new.
pub fn append_stats(path: &Path, stats: &BatchStats) -> Result<()> {
    let is_new = !path.is_file() || std::fs::metadata(path)?.len() == 0;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new().has_headers(is_new).from_writer(file);
    writer.serialize(stats)?;
    writer.flush()?;
    Ok(())
}
