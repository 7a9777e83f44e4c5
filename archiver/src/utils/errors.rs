//! Error types for the archiver.
//!
//! Two families: [`ArchiverError`] stops a batch (or the whole run), while
//! [`AssetError`] only excludes one asset from a batch and is counted in the
//! batch statistics.

use std::path::PathBuf;
use thiserror::Error;

use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum ArchiverError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed manifest {path}: {message}")]
    MalformedManifest { path: PathBuf, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config file error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Transfer failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Interrupted by operator")]
    Interrupted,
}

impl ArchiverError {
    pub fn malformed(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        ArchiverError::MalformedManifest {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            ArchiverError::Interrupted => 2,
            _ => 1,
        }
    }
}

/// Per-asset validation failure. Never fatal.
#[derive(Error, Debug)]
pub enum AssetError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Unable to read {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not contained within {root}")]
    PathOutOfScope { path: String, root: String },
}

impl AssetError {
    /// Missing and unreadable files are both counted as missing.
    pub fn is_missing(&self) -> bool {
        matches!(self, AssetError::FileNotFound(_) | AssetError::Unreadable { .. })
    }
}

pub type Result<T> = std::result::Result<T, ArchiverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ArchiverError::Interrupted.exit_code(), 2);
        assert_eq!(ArchiverError::Config("bad".to_string()).exit_code(), 1);
        assert_eq!(ArchiverError::malformed("m.txt", "no path").exit_code(), 1);
    }

    #[test]
    fn test_out_of_scope_message() {
        let err = AssetError::PathOutOfScope {
            path: "/abc/def.txt".to_string(),
            root: "/foo/bar/".to_string(),
        };
        assert_eq!(err.to_string(), "/abc/def.txt is not contained within /foo/bar/");
        assert!(!err.is_missing());
        assert!(AssetError::FileNotFound("/x".to_string()).is_missing());
    }
}
