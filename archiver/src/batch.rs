//! Batches: the set of assets bound for one destination, plus run statistics.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::asset::{absolute_path, calculate_relative_path, normalize_root, Asset};
use crate::manifest::AssetDescriptor;
use crate::utils::errors::AssetError;

/// Per-batch counters, written as one row of the stats file.
///
/// `total_assets == assets_found + assets_missing + assets_ignored` holds
/// after every call into [`Batch`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchStats {
    pub batch_name: String,
    pub total_assets: u64,
    pub assets_found: u64,
    pub assets_missing: u64,
    pub assets_ignored: u64,
    pub assets_transmitted: u64,
    pub asset_bytes_transmitted: u64,
    pub successful_deposits: u64,
    pub failed_deposits: u64,
    pub deposit_begin: String,
    pub deposit_end: String,
    /// Elapsed seconds.
    pub deposit_time: f64,
}

impl BatchStats {
    pub fn is_consistent(&self) -> bool {
        self.total_assets == self.assets_found + self.assets_missing + self.assets_ignored
    }
}

/// What [`Batch::add_asset`] did with a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetStatus {
    Added,
    Missing,
    OutOfScope,
    AlreadyCompleted,
}

/// A set of resources to be archived and the destination they go to.
#[derive(Debug)]
pub struct Batch {
    pub bucket: String,
    /// Name override for the whole batch.
    pub name: Option<String>,
    /// Absolute, always ends with `/`.
    pub asset_root: Option<String>,
    /// Results ledger recording what earlier runs deposited.
    pub results_path: Option<PathBuf>,
    pub contents: Vec<Asset>,
    pub stats: BatchStats,
}

impl Batch {
    pub fn new(
        bucket: &str,
        asset_root: Option<&Path>,
        name: Option<String>,
    ) -> std::io::Result<Self> {
        let asset_root = asset_root.map(normalize_root).transpose()?;
        let stats = BatchStats {
            batch_name: name.clone().unwrap_or_default(),
            ..Default::default()
        };

        Ok(Self {
            bucket: bucket.to_string(),
            name,
            asset_root,
            results_path: None,
            contents: Vec::new(),
            stats,
        })
    }

    pub fn with_results_ledger(mut self, path: impl Into<PathBuf>) -> Self {
        self.results_path = Some(path.into());
        self
    }

    /// Validates a descriptor and appends it to the batch.
    ///
    /// Missing files and paths outside the asset root are counted and logged,
    /// never returned as errors.
    pub fn add_asset(&mut self, descriptor: AssetDescriptor) -> AssetStatus {
        self.stats.total_assets += 1;

        match self.build_asset(descriptor) {
            Ok(asset) => {
                self.contents.push(asset);
                self.stats.assets_found += 1;
                AssetStatus::Added
            }
            Err(e) if e.is_missing() => {
                self.stats.assets_missing += 1;
                warn!("Skipping asset: {}", e);
                AssetStatus::Missing
            }
            Err(e) => {
                self.stats.assets_ignored += 1;
                warn!("Skipping asset: {}", e);
                AssetStatus::OutOfScope
            }
        }
    }

    /// Counts a descriptor the results ledger already records as deposited.
    pub fn skip_completed(&mut self, descriptor: &AssetDescriptor) -> AssetStatus {
        self.stats.total_assets += 1;
        self.stats.assets_ignored += 1;
        info!("Skipping {}: already deposited", descriptor.path);
        AssetStatus::AlreadyCompleted
    }

    fn build_asset(&self, descriptor: AssetDescriptor) -> Result<Asset, AssetError> {
        let AssetDescriptor {
            path,
            batch_name,
            md5,
            relpath,
            manifest_row,
            etag,
        } = descriptor;

        // Under a root, every asset must live inside it. A relative path
        // from the manifest only overrides the derived one.
        let relpath = match &self.asset_root {
            Some(root) => {
                let absolute = absolute_path(Path::new(&path))
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| path.clone());
                let derived = calculate_relative_path(root, &absolute)?;
                Some(relpath.unwrap_or(derived))
            }
            None => relpath,
        };

        Asset::new(&path, batch_name, md5, relpath, manifest_row, etag)
    }

    /// Object key for `asset`: `{name}/{relative path}`.
    ///
    /// The name is, in priority order, the batch override, the batch name on
    /// the asset's manifest row, then `default_name` (derived from the
    /// manifest's location). With no name at all the key is the bare path.
    pub fn key_path(&self, asset: &Asset, default_name: Option<&str>) -> String {
        let name = self
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .or(asset.batch_name.as_deref())
            .or(default_name.filter(|n| !n.is_empty()));

        match name {
            Some(name) => format!("{}/{}", name.trim_end_matches('/'), asset.key_suffix()),
            None => asset.key_suffix().to_string(),
        }
    }

    /// Total bytes of all accepted assets.
    pub fn total_bytes(&self) -> u64 {
        self.contents.iter().map(|a| a.bytes).sum()
    }
}
