//! Object storage interface.
//!
//! The deposit driver only needs two operations from a storage backend:
//! upload a file (multipart above the configured threshold) and fetch an
//! object's metadata so the reported ETag can be checked.

pub mod dry_run;
pub mod local;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub use dry_run::DryRunClient;
pub use local::LocalObjectStore;

/// Called with the number of bytes sent since the previous call. May be
/// invoked concurrently from several part uploads of the same object.
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Errors that can occur talking to the object store.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// Object not found.
    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// Upload did not complete.
    #[error("Upload of {path} to {bucket}/{key} failed: {message}")]
    UploadFailed {
        path: String,
        bucket: String,
        key: String,
        message: String,
    },

    /// Local or backend I/O error.
    #[error("I/O error for {path}: {message}")]
    Io { path: String, message: String },

    /// Invalid backend configuration.
    #[error("Invalid storage configuration: {message}")]
    InvalidConfig { message: String },
}

impl StorageError {
    pub(crate) fn io(path: &Path, err: std::io::Error) -> Self {
        StorageError::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}

/// Multipart settings handed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// Files larger than this are sent in parts.
    pub multipart_threshold: u64,
    pub multipart_chunksize: u64,
    pub max_concurrency: usize,
    pub use_threads: bool,
}

impl TransferConfig {
    /// Threshold and part size both equal `chunk_bytes`, so the store's
    /// ETag lines up with the locally computed composite digest.
    pub fn new(chunk_bytes: u64, max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            multipart_threshold: chunk_bytes,
            multipart_chunksize: chunk_bytes,
            max_concurrency,
            use_threads: max_concurrency > 1,
        }
    }
}

/// Everything needed to send one file.
#[derive(Debug, Clone)]
pub struct UploadRequest<'a> {
    pub local_path: &'a Path,
    pub bucket: &'a str,
    pub key: &'a str,
    pub storage_class: &'a str,
    /// User metadata stored alongside the object.
    pub metadata: &'a BTreeMap<String, String>,
    pub config: TransferConfig,
}

/// Metadata returned by a HEAD request.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMetadata {
    /// As reported by the store; may still carry surrounding quotes.
    pub etag: String,
    pub content_length: u64,
    /// Full response metadata, written verbatim to the transfer log.
    pub response: serde_json::Value,
}

impl ObjectMetadata {
    /// ETag with any surrounding double quotes removed.
    pub fn etag_unquoted(&self) -> &str {
        self.etag.trim_matches('"')
    }
}

/// A destination the deposit driver can write to.
pub trait StorageClient {
    /// Value recorded in the results ledger's `STORAGEPROVIDER` column.
    fn provider(&self) -> &str;

    /// Uploads `request.local_path`, reporting progress through `progress`.
    fn upload_file(
        &self,
        request: &UploadRequest<'_>,
        progress: ProgressCallback,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Fetches object metadata without downloading the content.
    fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> impl Future<Output = Result<ObjectMetadata, StorageError>> + Send;
}
