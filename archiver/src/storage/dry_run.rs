//! Storage stub for `--dry-run`: nothing leaves the machine.

use tracing::debug;

use super::{ObjectMetadata, ProgressCallback, StorageClient, StorageError, UploadRequest};

/// ETag reported for every object in a dry run.
pub const DRY_RUN_ETAG: &str = "DRY_RUN";

/// Accepts every upload and reports [`DRY_RUN_ETAG`] for every object.
#[derive(Debug, Clone, Default)]
pub struct DryRunClient;

impl DryRunClient {
    pub fn new() -> Self {
        Self
    }
}

impl StorageClient for DryRunClient {
    fn provider(&self) -> &str {
        "DRY_RUN"
    }

    async fn upload_file(
        &self,
        request: &UploadRequest<'_>,
        progress: ProgressCallback,
    ) -> Result<(), StorageError> {
        let size = tokio::fs::metadata(request.local_path)
            .await
            .map_err(|e| StorageError::io(request.local_path, e))?
            .len();
        debug!(
            "Dry run: skipping upload of {} to {}/{}",
            request.local_path.display(),
            request.bucket,
            request.key
        );
        progress(size);
        Ok(())
    }

    async fn head_object(&self, _bucket: &str, _key: &str) -> Result<ObjectMetadata, StorageError> {
        Ok(ObjectMetadata {
            etag: DRY_RUN_ETAG.to_string(),
            content_length: 0,
            response: serde_json::json!({ "HTTPHeaders": { "etag": DRY_RUN_ETAG } }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::TransferConfig;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_dry_run_reports_sentinel() -> std::io::Result<()> {
        let file = NamedTempFile::new()?;
        std::fs::write(file.path(), b"12345")?;

        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = Arc::clone(&seen);
        let metadata = BTreeMap::new();
        let request = UploadRequest {
            local_path: file.path(),
            bucket: "bucket",
            key: "a/b.txt",
            storage_class: "STANDARD",
            metadata: &metadata,
            config: TransferConfig::new(1024, 1),
        };

        let client = DryRunClient::new();
        client
            .upload_file(&request, Arc::new(move |n: u64| {
                seen_clone.fetch_add(n, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 5);

        let head = client.head_object("bucket", "a/b.txt").await.unwrap();
        assert_eq!(head.etag_unquoted(), DRY_RUN_ETAG);
        Ok(())
    }
}
