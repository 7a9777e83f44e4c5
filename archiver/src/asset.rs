//! Assets: local files slated for deposit.

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use crate::fingerprint::whole_file_digest;
use crate::utils::errors::AssetError;

/// Manifest columns that are only ever produced by a deposit. They are
/// dropped from incoming rows so a results ledger can be fed back in as a
/// manifest without stale outcomes leaking into the new ledger.
pub const OUTPUT_ONLY_COLUMNS: &[&str] = &["RESULT", "STORAGELOCATION", "STORAGEPROVIDER"];

/// An ordered manifest row, passed through to the results ledger verbatim.
pub type ManifestRow = Vec<(String, String)>;

/// A binary resource to be archived.
#[derive(Debug, Clone)]
pub struct Asset {
    pub local_path: String,
    pub batch_name: Option<String>,
    pub md5: String,
    pub filename: String,
    pub directory: String,
    /// Modification time, seconds since the Unix epoch.
    pub mtime: i64,
    pub bytes: u64,
    /// Upper-cased, without the leading dot.
    pub extension: String,
    pub relpath: Option<String>,
    pub manifest_row: ManifestRow,
    /// Provider digest supplied by the manifest, trusted without recomputation.
    pub etag: Option<String>,
}

impl Asset {
    /// Builds an asset from a local path, computing the MD5 if `md5` is not
    /// supplied. The file must exist and be readable.
    pub fn new(
        path: &str,
        batch_name: Option<String>,
        md5: Option<String>,
        relpath: Option<String>,
        manifest_row: ManifestRow,
        etag: Option<String>,
    ) -> Result<Self, AssetError> {
        let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AssetError::FileNotFound(path.to_string()),
            _ => AssetError::Unreadable {
                path: path.to_string(),
                source: e,
            },
        })?;
        if metadata.is_dir() {
            return Err(AssetError::FileNotFound(path.to_string()));
        }

        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();

        let md5 = match md5.filter(|m| !m.is_empty()) {
            Some(md5) => md5,
            None => whole_file_digest(Path::new(path)).map_err(|e| AssetError::Unreadable {
                path: path.to_string(),
                source: e,
            })?,
        };

        let as_path = Path::new(path);
        let filename = as_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let directory = as_path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = Path::new(&filename)
            .extension()
            .map(|e| e.to_string_lossy().to_uppercase())
            .unwrap_or_default();

        let manifest_row = manifest_row
            .into_iter()
            .filter(|(k, _)| !OUTPUT_ONLY_COLUMNS.contains(&k.as_str()))
            .collect();

        Ok(Self {
            local_path: path.to_string(),
            batch_name: batch_name.filter(|n| !n.is_empty()),
            md5,
            filename,
            directory,
            mtime,
            bytes: metadata.len(),
            extension,
            relpath,
            manifest_row,
            etag: etag.filter(|e| !e.is_empty()),
        })
    }

    /// Path used under the batch name when building the object key.
    pub fn key_suffix(&self) -> &str {
        self.relpath.as_deref().unwrap_or(&self.filename)
    }
}

/// Absolute form of `root`, normalised to end with a path separator.
pub fn normalize_root(root: &Path) -> std::io::Result<String> {
    let mut root = absolute_path(root)?.to_string_lossy().into_owned();
    if !root.ends_with('/') {
        root.push('/');
    }
    Ok(root)
}

/// Returns `local_path` with the `root` prefix removed.
///
/// `root` is expected to come from [`normalize_root`]; a missing trailing
/// separator is added so `/foo/bar` never matches `/foo/barn/x`.
pub fn calculate_relative_path(root: &str, local_path: &str) -> Result<String, AssetError> {
    let root = if root.ends_with('/') {
        root.to_string()
    } else {
        format!("{}/", root)
    };

    local_path
        .strip_prefix(root.as_str())
        .map(str::to_string)
        .ok_or_else(|| AssetError::PathOutOfScope {
            path: local_path.to_string(),
            root,
        })
}

/// Lexically absolute path: joined onto the current directory if relative,
/// with `.` and `..` components resolved. Symlinks are not followed.
pub fn absolute_path(path: &Path) -> std::io::Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}
