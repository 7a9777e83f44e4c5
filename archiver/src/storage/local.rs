//! Filesystem-backed object store.
//!
//! Objects live at `<root>/<bucket>/<key>`. Each object has a sidecar
//! document at `<root>/.metadata/<bucket>/<key>.json` holding what a HEAD
//! request on a cloud store would return, including an ETag computed the
//! way multipart uploads compute it. Uploads are assembled under
//! `<root>/.staging/<bucket>/<key>` and renamed into place once complete.

use chrono::Utc;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{ObjectMetadata, ProgressCallback, StorageClient, StorageError, UploadRequest};
use crate::fingerprint::fold_part_digests;

const METADATA_DIR: &str = ".metadata";
const STAGING_DIR: &str = ".staging";
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Sidecar document stored next to each object.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredObject {
    etag: String,
    content_length: u64,
    parts: usize,
    storage_class: String,
    last_modified: String,
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        validate_segment(bucket)?;
        validate_segment(key)?;
        Ok(self.root.join(bucket).join(key))
    }

    fn staging_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(STAGING_DIR).join(bucket).join(key)
    }

    fn metadata_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root
            .join(METADATA_DIR)
            .join(bucket)
            .join(format!("{}.json", key))
    }
}

/// Keys must stay inside their bucket directory.
fn validate_segment(segment: &str) -> Result<(), StorageError> {
    let path = Path::new(segment);
    let escapes = segment.is_empty()
        || path
            .components()
            .any(|c| match c {
                Component::Normal(name) => name == METADATA_DIR || name == STAGING_DIR,
                _ => true,
            });
    if escapes {
        return Err(StorageError::InvalidConfig {
            message: format!("invalid bucket or key: {:?}", segment),
        });
    }
    Ok(())
}

/// A partially written upload. Dropping it before [`StagingFile::commit`]
/// stops the part copies still running and deletes the file.
struct StagingFile {
    path: PathBuf,
    abort: Arc<AtomicBool>,
    committed: bool,
}

impl StagingFile {
    fn create(path: PathBuf, size: u64) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        let file = File::create(&path).map_err(|e| StorageError::io(&path, e))?;
        let staging = Self {
            path,
            abort: Arc::new(AtomicBool::new(false)),
            committed: false,
        };
        file.set_len(size)
            .map_err(|e| StorageError::io(&staging.path, e))?;
        Ok(staging)
    }

    async fn commit(mut self, target: &Path) -> Result<(), StorageError> {
        tokio::fs::rename(&self.path, target)
            .await
            .map_err(|e| StorageError::io(target, e))?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if !self.committed {
            self.abort.store(true, Ordering::Relaxed);
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove staging file {}: {}", self.path.display(), e);
                }
            }
        }
    }
}

/// Copies `len` bytes at `offset` from `src` into the same range of `dst`,
/// returning the MD5 of the copied range. Stops with `Interrupted` once
/// `abort` is set.
fn copy_part(
    src: &Path,
    dst: &Path,
    offset: u64,
    len: u64,
    progress: &ProgressCallback,
    abort: &AtomicBool,
) -> io::Result<[u8; 16]> {
    let mut reader = File::open(src)?;
    reader.seek(SeekFrom::Start(offset))?;
    let mut reader = reader.take(len);

    let mut writer = OpenOptions::new().write(true).open(dst)?;
    writer.seek(SeekFrom::Start(offset))?;

    let mut hasher = Md5::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        if abort.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "upload abandoned"));
        }
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
        progress(n as u64);
    }
    writer.flush()?;
    Ok(hasher.finalize().into())
}

impl StorageClient for LocalObjectStore {
    fn provider(&self) -> &str {
        "LOCAL"
    }

    async fn upload_file(
        &self,
        request: &UploadRequest<'_>,
        progress: ProgressCallback,
    ) -> Result<(), StorageError> {
        let failed = |message: String| StorageError::UploadFailed {
            path: request.local_path.display().to_string(),
            bucket: request.bucket.to_string(),
            key: request.key.to_string(),
            message,
        };

        let object_path = self.object_path(request.bucket, request.key)?;
        let size = tokio::fs::metadata(request.local_path)
            .await
            .map_err(|e| StorageError::io(request.local_path, e))?
            .len();

        if let Some(parent) = object_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }
        let staging = StagingFile::create(self.staging_path(request.bucket, request.key), size)?;

        // Parts only above the threshold: a file exactly one chunk long is a
        // single PUT, matching the single-part composite digest.
        let config = request.config;
        let chunk = config.multipart_chunksize.max(1);
        let part_ranges: Vec<(u64, u64)> = if size > config.multipart_threshold {
            (0..size.div_ceil(chunk))
                .map(|i| (i * chunk, chunk.min(size - i * chunk)))
                .collect()
        } else {
            vec![(0, size)]
        };

        let permits = if config.use_threads { config.max_concurrency } else { 1 };
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut handles = Vec::with_capacity(part_ranges.len());

        for (offset, len) in part_ranges {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| failed(format!("semaphore closed: {}", e)))?;
            let src = request.local_path.to_path_buf();
            let dst = staging.path.clone();
            let progress = Arc::clone(&progress);
            let abort = Arc::clone(&staging.abort);

            handles.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                copy_part(&src, &dst, offset, len, &progress, &abort)
            }));
        }

        let mut part_digests = Vec::with_capacity(handles.len());
        for handle in handles {
            let digest = handle
                .await
                .map_err(|e| failed(format!("part task failed: {}", e)))?
                .map_err(|e| failed(e.to_string()))?;
            part_digests.push(digest);
        }

        staging.commit(&object_path).await?;

        let stored = StoredObject {
            etag: fold_part_digests(&part_digests),
            content_length: size,
            parts: part_digests.len(),
            storage_class: request.storage_class.to_string(),
            last_modified: Utc::now().to_rfc3339(),
            metadata: request.metadata.clone(),
        };
        let metadata_path = self.metadata_path(request.bucket, request.key);
        if let Some(parent) = metadata_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }
        let document = serde_json::to_vec_pretty(&stored).map_err(|e| failed(e.to_string()))?;
        tokio::fs::write(&metadata_path, document)
            .await
            .map_err(|e| StorageError::io(&metadata_path, e))?;

        debug!(
            "Stored {}/{} ({} bytes, {} parts)",
            request.bucket,
            request.key,
            size,
            stored.parts
        );
        Ok(())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata, StorageError> {
        validate_segment(bucket)?;
        validate_segment(key)?;
        let metadata_path = self.metadata_path(bucket, key);

        let document = match tokio::fs::read(&metadata_path).await {
            Ok(document) => document,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(StorageError::io(&metadata_path, e)),
        };
        let stored: StoredObject = serde_json::from_slice(&document).map_err(|e| StorageError::Io {
            path: metadata_path.display().to_string(),
            message: e.to_string(),
        })?;

        let quoted_etag = format!("\"{}\"", stored.etag);
        let response = serde_json::json!({
            "HTTPHeaders": {
                "etag": quoted_etag,
                "content-length": stored.content_length.to_string(),
                "last-modified": stored.last_modified,
                "x-storage-class": stored.storage_class,
            },
            "Metadata": stored.metadata,
            "Parts": stored.parts,
        });

        Ok(ObjectMetadata {
            etag: quoted_etag,
            content_length: stored.content_length,
            response,
        })
    }
}
