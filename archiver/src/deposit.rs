//! Deposit reconciliation.
//!
//! [`Depositor`] walks a batch in manifest order. For each asset it works
//! out the ETag the store should report, hands the file to the storage
//! client, asks the store what it actually holds and records the verdict in
//! the results ledger.
//!
//! Failure policy:
//!
//! - a transfer or verification request that fails stops the rest of the
//!   batch, since whatever broke (credentials, network, quota) will break
//!   every following asset too;
//! - an ETag mismatch is recorded as `failed` and the next asset is tried;
//! - an operator interruption abandons the in-flight asset without writing
//!   a row for it and surfaces as [`ArchiverError::Interrupted`].
//!
//! An ETag supplied by the manifest is trusted as the expected value and the
//! file is not re-read to check it.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::PoisonError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::batch::{Batch, BatchStats};
use crate::config::{AssetSource, DepositConfig};
use crate::fingerprint::EtagCalculator;
use crate::ledger::{
    append_stats, ResultsLedger, TransferLog, RESULT_DRY_RUN, RESULT_FAILED, RESULT_SUCCESS,
};
use crate::manifest::{detect, AssetDescriptor, Manifest};
use crate::storage::{
    DryRunClient, LocalObjectStore, StorageClient, TransferConfig, UploadRequest,
};
use crate::transfer::progress::{format_bytes, format_duration, ProgressTracker};
use crate::utils::errors::{ArchiverError, Result};

pub const RESULTS_FILE: &str = "results.csv";
pub const TRANSFER_LOG_FILE: &str = "assets.jsonl";

/// How a batch deposit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepositOutcome {
    /// Every asset was sent and verified (matching or not).
    Completed,
    /// A transfer failed and the remaining assets were not attempted.
    Aborted,
}

/// Sends the assets of one batch through a [`StorageClient`].
pub struct Depositor<'a, C> {
    client: &'a C,
    config: &'a DepositConfig,
    log_dir: PathBuf,
    cancel: CancellationToken,
}

impl<'a, C: StorageClient> Depositor<'a, C> {
    pub fn new(
        client: &'a C,
        config: &'a DepositConfig,
        log_dir: impl Into<PathBuf>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            config,
            log_dir: log_dir.into(),
            cancel,
        }
    }

    /// Runs `fut` unless the operator interrupts first.
    async fn until_cancelled<F: Future>(&self, fut: F) -> Result<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ArchiverError::Interrupted),
            output = fut => Ok(output),
        }
    }

    /// Deposits every asset in `batch.contents`, updating `batch.stats`.
    ///
    /// `default_name` is the batch name derived from the manifest location,
    /// used for assets without a name of their own.
    pub async fn execute(
        &self,
        batch: &mut Batch,
        default_name: Option<&str>,
    ) -> Result<DepositOutcome> {
        let calculator = EtagCalculator::new(self.config.chunk_bytes)?;
        let transfer = TransferConfig::new(self.config.chunk_bytes, self.config.max_concurrency);

        info!("Running deposit with the following options:");
        info!("  - Target Bucket: {}", batch.bucket);
        info!(
            "  - Local Asset Root: {}",
            batch.asset_root.as_deref().unwrap_or("(none)")
        );
        info!("  - Storage Class: {}", self.config.storage_class);
        info!("  - Chunk Size: {} ({} bytes)", self.config.chunk_size, self.config.chunk_bytes);
        info!("  - Use Threads: {}", transfer.use_threads);
        info!("  - Max Threads: {}", transfer.max_concurrency);
        info!("  - Storage Provider: {}", self.client.provider());
        info!("  - Dry Run: {}", self.config.dry_run);

        let begin = Utc::now();
        batch.stats.deposit_begin = begin.to_rfc3339();

        let columns = ResultsLedger::columns_for(
            batch
                .contents
                .first()
                .map(|a| a.manifest_row.as_slice())
                .unwrap_or_default(),
        );
        let results_path = batch
            .results_path
            .clone()
            .unwrap_or_else(|| self.log_dir.join(RESULTS_FILE));
        let mut ledger = ResultsLedger::open(&results_path, &columns)?;
        let mut transfer_log = TransferLog::open(&self.log_dir.join(TRANSFER_LOG_FILE))?;

        let keys: Vec<String> = batch
            .contents
            .iter()
            .map(|asset| batch.key_path(asset, default_name))
            .collect();
        let tracker = ProgressTracker::shared(batch.total_bytes(), batch.contents.len());
        let total = batch.contents.len();
        let mut outcome = DepositOutcome::Completed;

        info!("Depositing {} assets ...", total);

        for (n, (asset, key)) in batch.contents.iter().zip(&keys).enumerate() {
            if self.cancel.is_cancelled() {
                return Err(ArchiverError::Interrupted);
            }
            let id = n + 1;
            let location = format!("{}/{}", batch.bucket, key);

            let expected_etag = match &asset.etag {
                Some(etag) => Ok(etag.clone()),
                None => {
                    let path = PathBuf::from(&asset.local_path);
                    let md5 = asset.md5.clone();
                    let digest = tokio::task::spawn_blocking(move || {
                        calculator.composite_digest(&path, Some(&md5))
                    });
                    match self.until_cancelled(digest).await? {
                        Ok(result) => result,
                        Err(e) => Err(ArchiverError::Io(std::io::Error::other(e))),
                    }
                }
            };
            let expected_etag = match expected_etag {
                Ok(etag) => etag,
                Err(e) => {
                    batch.stats.failed_deposits += 1;
                    error!("Cannot fingerprint {}: {}", asset.local_path, e);
                    self.abort(total - n - 1);
                    outcome = DepositOutcome::Aborted;
                    break;
                }
            };

            info!("({}) {}", id, asset.filename.to_uppercase());
            info!("    FILE: {}", asset.local_path);
            info!(" KEYPATH: {}", key);
            info!("     EXT: {}", asset.extension);
            info!("   MTIME: {}", asset.mtime);
            info!("   BYTES: {}", asset.bytes);
            info!("     MD5: {}", asset.md5);
            info!("    ETAG: {}", expected_etag);

            let metadata = BTreeMap::from([
                ("md5".to_string(), asset.md5.clone()),
                ("bytes".to_string(), asset.bytes.to_string()),
            ]);
            let request = UploadRequest {
                local_path: Path::new(&asset.local_path),
                bucket: &batch.bucket,
                key,
                storage_class: &self.config.storage_class,
                metadata: &metadata,
                config: transfer,
            };

            batch.stats.assets_transmitted += 1;
            tracker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .begin_asset(key);
            let progress = ProgressTracker::callback(&tracker);
            let uploaded = self
                .until_cancelled(self.client.upload_file(&request, progress))
                .await?;
            let sent = tracker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .finish_asset();
            batch.stats.asset_bytes_transmitted += sent;

            if let Err(e) = uploaded {
                batch.stats.failed_deposits += 1;
                error!("{}", e);
                self.abort(total - n - 1);
                outcome = DepositOutcome::Aborted;
                break;
            }

            info!("Upload complete! Verifying...");
            let head = match self
                .until_cancelled(self.client.head_object(&batch.bucket, key))
                .await?
            {
                Ok(head) => head,
                Err(e) => {
                    batch.stats.failed_deposits += 1;
                    error!("Error verifying {}: {}", location, e);
                    self.abort(total - n - 1);
                    outcome = DepositOutcome::Aborted;
                    break;
                }
            };

            transfer_log.record(&location, &head.response)?;

            let remote_etag = head.etag_unquoted();
            info!("    -> Local:  {}", expected_etag);
            info!("    -> Remote: {}", remote_etag);

            let result = if self.config.dry_run {
                batch.stats.successful_deposits += 1;
                RESULT_DRY_RUN
            } else if remote_etag == expected_etag {
                batch.stats.successful_deposits += 1;
                info!("ETag match! Transfer success!");
                RESULT_SUCCESS
            } else {
                batch.stats.failed_deposits += 1;
                warn!(
                    "ETag mismatch for {}: expected {}, store reports {}",
                    location, expected_etag, remote_etag
                );
                RESULT_FAILED
            };

            let id = id.to_string();
            let mut row: Vec<(&str, &str)> = vec![
                ("ID", id.as_str()),
                ("MD5", asset.md5.as_str()),
                ("PATH", asset.local_path.as_str()),
                ("KEYPATH", key.as_str()),
                ("ETAG", remote_etag),
                ("RESULT", result),
                ("STORAGEPROVIDER", self.client.provider()),
                ("STORAGELOCATION", location.as_str()),
            ];
            row.extend(asset.manifest_row.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            ledger.append(&row)?;
        }

        let end = Utc::now();
        finish_timing(&mut batch.stats, begin, end);
        Ok(outcome)
    }

    fn abort(&self, remaining: usize) {
        if remaining > 0 {
            error!("Skipping the remaining {} assets of this batch", remaining);
        }
    }
}

fn finish_timing(stats: &mut BatchStats, begin: DateTime<Utc>, end: DateTime<Utc>) {
    stats.deposit_end = end.to_rfc3339();
    stats.deposit_time = (end - begin).num_milliseconds() as f64 / 1000.0;
}

/// Resolves a relative log directory against the manifest's directory.
fn resolve_log_dir(log_dir: &Path, manifest: &Manifest) -> std::io::Result<PathBuf> {
    if log_dir.is_absolute() {
        Ok(log_dir.to_path_buf())
    } else {
        Ok(manifest.base_dir()?.join(log_dir))
    }
}

/// Reads the manifest into `batch` on the blocking pool, so hashing assets
/// without a listed MD5 never stalls the runtime. Interruption abandons the
/// load; the loader itself stops at the next asset.
async fn load_batch(
    config: &DepositConfig,
    manifest: Manifest,
    mut batch: Batch,
    cancel: &CancellationToken,
) -> Result<Batch> {
    let source = config.source.clone();
    let etag_expected = config.etag_expected;
    let token = cancel.clone();

    let loader = tokio::task::spawn_blocking(move || -> Result<Batch> {
        match source {
            AssetSource::Manifest(_) => manifest.load(&mut batch, etag_expected, &token)?,
            AssetSource::SingleAsset(path) => {
                batch.add_asset(AssetDescriptor::new(path.to_string_lossy()));
            }
        }
        Ok(batch)
    });

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ArchiverError::Interrupted),
        joined = loader => joined.map_err(|e| ArchiverError::Io(std::io::Error::other(e)))?,
    }
}

/// Loads, deposits and summarises one batch.
///
/// Returns the batch statistics, including for batches whose remainder was
/// aborted by a failed transfer.
pub async fn run_batch(config: &DepositConfig, cancel: CancellationToken) -> Result<BatchStats> {
    if cancel.is_cancelled() {
        return Err(ArchiverError::Interrupted);
    }

    let store = match (&config.storage_root, config.dry_run) {
        (_, true) => None,
        (Some(root), false) => Some(LocalObjectStore::new(root)),
        (None, false) => {
            return Err(ArchiverError::Config(
                "No storage root configured; set [storage] root or pass --storage-root".to_string(),
            ))
        }
    };

    let manifest = detect(config.manifest_path())?;
    let default_name = manifest.default_batch_name();
    let log_dir = resolve_log_dir(&config.log_dir, &manifest)?;
    std::fs::create_dir_all(&log_dir)?;

    let mut batch = Batch::new(&config.bucket, config.asset_root.as_deref(), config.name.clone())?
        .with_results_ledger(log_dir.join(RESULTS_FILE));
    batch.stats.batch_name = config
        .name
        .clone()
        .or_else(|| default_name.clone())
        .unwrap_or_default();

    let mut batch = load_batch(config, manifest, batch, &cancel).await?;

    let outcome = match &store {
        Some(store) => {
            Depositor::new(store, config, &log_dir, cancel)
                .execute(&mut batch, default_name.as_deref())
                .await?
        }
        None => {
            let client = DryRunClient::new();
            Depositor::new(&client, config, &log_dir, cancel)
                .execute(&mut batch, default_name.as_deref())
                .await?
        }
    };

    log_summary(&batch.stats, outcome);
    Ok(batch.stats)
}

/// Runs `configs` in order, appending one row per batch to `stats_file`.
///
/// A failed transfer only cuts its own batch short. Interruption, and any
/// error that is not about a single transfer, stops the whole run.
pub async fn run_batches(
    configs: &[DepositConfig],
    stats_file: &Path,
    cancel: CancellationToken,
) -> Result<Vec<BatchStats>> {
    let mut all_stats = Vec::with_capacity(configs.len());
    for (index, config) in configs.iter().enumerate() {
        info!("Batch {} of {} (bucket {})", index + 1, configs.len(), config.bucket);
        let stats = run_batch(config, cancel.clone()).await?;
        append_stats(stats_file, &stats)?;
        all_stats.push(stats);
    }
    Ok(all_stats)
}

fn log_summary(stats: &BatchStats, outcome: DepositOutcome) {
    info!("Batch Name: {}", stats.batch_name);
    info!("    Total Assets: {}", stats.total_assets);
    info!("    Assets Found: {}", stats.assets_found);
    info!("    Assets Missing: {}", stats.assets_missing);
    info!("    Assets Ignored: {}", stats.assets_ignored);
    info!("    Assets Transmitted: {}", stats.assets_transmitted);
    info!(
        "    Asset Bytes Transmitted: {} ({})",
        stats.asset_bytes_transmitted,
        format_bytes(stats.asset_bytes_transmitted)
    );
    info!("    Successful Deposits: {}", stats.successful_deposits);
    info!("    Failed Deposits: {}", stats.failed_deposits);
    info!("    Deposit Begin: {}", stats.deposit_begin);
    info!("    Deposit End: {}", stats.deposit_end);
    info!(
        "    Deposit Time: {:.3}s ({})",
        stats.deposit_time,
        format_duration(stats.deposit_time as u64)
    );
    if outcome == DepositOutcome::Aborted {
        warn!("Batch {} was aborted after a transfer failure", stats.batch_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::EMPTY_MD5;
    use crate::storage::{ObjectMetadata, ProgressCallback, StorageError};
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    const HELLO_MD5: &str = "b1946ac92492d2347c6235b4d2611184";
    const WORLD_MD5: &str = "591785b794601e212b260e25925636fd";

    /// Filesystem store with injectable failures.
    struct ScriptedClient {
        inner: LocalObjectStore,
        fail_upload_for: Option<String>,
        wrong_etag_for: Option<String>,
        interrupt_on_upload: Option<CancellationToken>,
    }

    impl ScriptedClient {
        fn new(root: &Path) -> Self {
            Self {
                inner: LocalObjectStore::new(root),
                fail_upload_for: None,
                wrong_etag_for: None,
                interrupt_on_upload: None,
            }
        }
    }

    impl StorageClient for ScriptedClient {
        fn provider(&self) -> &str {
            "SCRIPTED"
        }

        async fn upload_file(
            &self,
            request: &UploadRequest<'_>,
            progress: ProgressCallback,
        ) -> std::result::Result<(), StorageError> {
            if let Some(token) = &self.interrupt_on_upload {
                token.cancel();
                std::future::pending::<()>().await;
            }
            if self.fail_upload_for.as_deref() == Some(request.key) {
                return Err(StorageError::UploadFailed {
                    path: request.local_path.display().to_string(),
                    bucket: request.bucket.to_string(),
                    key: request.key.to_string(),
                    message: "access denied".to_string(),
                });
            }
            self.inner.upload_file(request, progress).await
        }

        async fn head_object(
            &self,
            bucket: &str,
            key: &str,
        ) -> std::result::Result<ObjectMetadata, StorageError> {
            let mut head = self.inner.head_object(bucket, key).await?;
            if self.wrong_etag_for.as_deref() == Some(key) {
                head.etag = "\"00000000000000000000000000000000\"".to_string();
            }
            Ok(head)
        }
    }

    struct Fixture {
        dir: TempDir,
    }

    impl Fixture {
        /// `data/` holds the assets, `manifests/` the manifest and logs.
        fn new<D: AsRef<[u8]>>(files: &[(&str, D)]) -> std::io::Result<Self> {
            let dir = TempDir::new()?;
            fs::create_dir_all(dir.path().join("data"))?;
            fs::create_dir_all(dir.path().join("manifests"))?;
            for (name, content) in files {
                fs::write(dir.path().join("data").join(name), content)?;
            }
            Ok(Self { dir })
        }

        fn data(&self, name: &str) -> PathBuf {
            self.dir.path().join("data").join(name)
        }

        fn store(&self) -> PathBuf {
            self.dir.path().join("store")
        }

        fn results(&self) -> PathBuf {
            self.dir.path().join("manifests/logs").join(RESULTS_FILE)
        }

        fn write_manifest(&self, lines: &[(&str, &str)]) -> std::io::Result<PathBuf> {
            let content: String = lines
                .iter()
                .map(|(md5, name)| format!("{} {}\n", md5, self.data(name).display()))
                .collect();
            let path = self.dir.path().join("manifests/manifest.txt");
            fs::write(&path, content)?;
            Ok(path)
        }

        fn config(&self, manifest: PathBuf) -> DepositConfig {
            DepositConfig {
                bucket: "bucket".to_string(),
                source: AssetSource::Manifest(manifest),
                asset_root: Some(self.dir.path().join("data")),
                name: None,
                chunk_size: "8KB".to_string(),
                chunk_bytes: 8 * 1024,
                storage_class: "STANDARD".to_string(),
                max_concurrency: 2,
                log_dir: PathBuf::from("logs"),
                dry_run: false,
                etag_expected: false,
                storage_root: Some(self.store()),
            }
        }
    }

    fn read_rows(path: &Path) -> Result<Vec<HashMap<String, String>>> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut rows = Vec::new();
        for row in reader.deserialize() {
            rows.push(row?);
        }
        Ok(rows)
    }

    async fn load_and_execute<C: StorageClient>(
        client: &C,
        config: &DepositConfig,
        cancel: CancellationToken,
    ) -> Result<(Batch, Result<DepositOutcome>)> {
        let manifest = detect(config.manifest_path())?;
        let log_dir = resolve_log_dir(&config.log_dir, &manifest)?;
        fs::create_dir_all(&log_dir)?;
        let mut batch = Batch::new(&config.bucket, config.asset_root.as_deref(), None)?
            .with_results_ledger(log_dir.join(RESULTS_FILE));
        manifest.load(&mut batch, config.etag_expected, &cancel)?;

        let outcome = Depositor::new(client, config, &log_dir, cancel)
            .execute(&mut batch, manifest.default_batch_name().as_deref())
            .await;
        Ok((batch, outcome))
    }

    #[tokio::test]
    async fn test_empty_file_end_to_end() -> Result<()> {
        let fixture = Fixture::new(&[("empty.txt", b"")])?;
        let manifest = fixture.write_manifest(&[(EMPTY_MD5, "empty.txt")])?;
        let config = fixture.config(manifest);

        let stats = run_batch(&config, CancellationToken::new()).await?;
        assert_eq!(stats.batch_name, "manifests");
        assert_eq!(stats.total_assets, 1);
        assert_eq!(stats.assets_found, 1);
        assert_eq!(stats.successful_deposits, 1);
        assert_eq!(stats.failed_deposits, 0);
        assert!(!stats.deposit_begin.is_empty());
        assert!(!stats.deposit_end.is_empty());

        let rows = read_rows(&fixture.results())?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["ID"], "1");
        assert_eq!(rows[0]["MD5"], EMPTY_MD5);
        assert_eq!(rows[0]["ETAG"], EMPTY_MD5);
        assert_eq!(rows[0]["KEYPATH"], "manifests/empty.txt");
        assert_eq!(rows[0]["RESULT"], RESULT_SUCCESS);
        assert_eq!(rows[0]["STORAGEPROVIDER"], "LOCAL");
        assert_eq!(rows[0]["STORAGELOCATION"], "bucket/manifests/empty.txt");

        assert!(fixture.store().join("bucket/manifests/empty.txt").is_file());
        let log_path = fixture.dir.path().join("manifests/logs").join(TRANSFER_LOG_FILE);
        let log = fs::read_to_string(log_path)?;
        let entry: serde_json::Value = serde_json::from_str(log.trim())?;
        assert_eq!(entry["asset"], "bucket/manifests/empty.txt");
        Ok(())
    }

    #[tokio::test]
    async fn test_multipart_asset_verifies() -> Result<()> {
        let data: Vec<u8> = (0..=255u8).cycle().take(20 * 1024).collect();
        let fixture = Fixture::new(&[("large.bin", &data)])?;
        let md5 = crate::fingerprint::whole_file_digest(&fixture.data("large.bin"))?;
        let manifest = fixture.write_manifest(&[(&md5, "large.bin")])?;

        let stats = run_batch(&fixture.config(manifest), CancellationToken::new()).await?;
        assert_eq!(stats.successful_deposits, 1);
        assert_eq!(stats.asset_bytes_transmitted, 20 * 1024);

        let rows = read_rows(&fixture.results())?;
        assert!(rows[0]["ETAG"].ends_with("-3"));
        assert_eq!(rows[0]["RESULT"], RESULT_SUCCESS);
        Ok(())
    }

    #[tokio::test]
    async fn test_rerun_skips_completed_assets() -> Result<()> {
        let fixture = Fixture::new(&[("a.txt", b"hello\n"), ("b.txt", b"world\n")])?;
        let manifest = fixture.write_manifest(&[(HELLO_MD5, "a.txt"), (WORLD_MD5, "b.txt")])?;
        let config = fixture.config(manifest);

        let first = run_batch(&config, CancellationToken::new()).await?;
        assert_eq!(first.successful_deposits, 2);

        let second = run_batch(&config, CancellationToken::new()).await?;
        assert_eq!(second.total_assets, 2);
        assert_eq!(second.assets_ignored, 2);
        assert_eq!(second.assets_transmitted, 0);
        assert!(second.is_consistent());
        assert_eq!(read_rows(&fixture.results())?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_mismatch_continues_with_next_asset() -> Result<()> {
        let fixture = Fixture::new(&[("a.txt", b"hello\n"), ("b.txt", b"world\n")])?;
        let manifest = fixture.write_manifest(&[(HELLO_MD5, "a.txt"), (WORLD_MD5, "b.txt")])?;
        let config = fixture.config(manifest);

        let mut client = ScriptedClient::new(&fixture.store());
        client.wrong_etag_for = Some("manifests/a.txt".to_string());

        let (batch, outcome) = load_and_execute(&client, &config, CancellationToken::new()).await?;
        assert_eq!(outcome?, DepositOutcome::Completed);
        assert_eq!(batch.stats.assets_transmitted, 2);
        assert_eq!(batch.stats.failed_deposits, 1);
        assert_eq!(batch.stats.successful_deposits, 1);

        let rows = read_rows(&fixture.results())?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["RESULT"], RESULT_FAILED);
        assert_eq!(rows[0]["STORAGEPROVIDER"], "SCRIPTED");
        assert_eq!(rows[1]["RESULT"], RESULT_SUCCESS);

        // The failed asset is picked up again on the next run
        let mut retry = Batch::new("bucket", config.asset_root.as_deref(), None)?
            .with_results_ledger(fixture.results());
        detect(config.manifest_path())?.load(&mut retry, false, &CancellationToken::new())?;
        assert_eq!(retry.contents.len(), 1);
        assert_eq!(retry.contents[0].md5, HELLO_MD5);
        Ok(())
    }

    #[tokio::test]
    async fn test_transfer_failure_aborts_remainder() -> Result<()> {
        let fixture = Fixture::new(&[
            ("a.txt", b"hello\n"),
            ("b.txt", b"world\n"),
            ("c.txt", b"hello\n"),
        ])?;
        let manifest = fixture.write_manifest(&[
            (HELLO_MD5, "a.txt"),
            (WORLD_MD5, "b.txt"),
            (HELLO_MD5, "c.txt"),
        ])?;
        let config = fixture.config(manifest);

        let mut client = ScriptedClient::new(&fixture.store());
        client.fail_upload_for = Some("manifests/b.txt".to_string());

        let (batch, outcome) = load_and_execute(&client, &config, CancellationToken::new()).await?;
        assert_eq!(outcome?, DepositOutcome::Aborted);
        assert_eq!(batch.stats.assets_transmitted, 2);
        assert_eq!(batch.stats.successful_deposits, 1);
        assert_eq!(batch.stats.failed_deposits, 1);
        assert!(!batch.stats.deposit_end.is_empty());

        let rows = read_rows(&fixture.results())?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["KEYPATH"], "manifests/a.txt");
        Ok(())
    }

    #[tokio::test]
    async fn test_interruption_writes_no_row() -> Result<()> {
        let fixture = Fixture::new(&[("a.txt", b"hello\n")])?;
        let manifest = fixture.write_manifest(&[(HELLO_MD5, "a.txt")])?;
        let config = fixture.config(manifest);

        let cancel = CancellationToken::new();
        let mut client = ScriptedClient::new(&fixture.store());
        client.interrupt_on_upload = Some(cancel.clone());

        let (batch, outcome) = load_and_execute(&client, &config, cancel).await?;
        assert!(matches!(outcome, Err(ArchiverError::Interrupted)));
        assert_eq!(batch.stats.successful_deposits, 0);
        assert!(read_rows(&fixture.results())?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_before_start() -> Result<()> {
        let fixture = Fixture::new(&[("a.txt", b"hello\n")])?;
        let manifest = fixture.write_manifest(&[(HELLO_MD5, "a.txt")])?;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = run_batch(&fixture.config(manifest), cancel).await;
        assert!(matches!(result, Err(ArchiverError::Interrupted)));
        assert!(!fixture.store().join("bucket/manifests/a.txt").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_completed_batch() -> Result<()> {
        let fixture = Fixture::new(&[("a.txt", b"hello\n")])?;
        let manifest = fixture.write_manifest(&[(HELLO_MD5, "a.txt")])?;
        let config = fixture.config(manifest);
        run_batch(&config, CancellationToken::new()).await?;

        // Nothing is left to send, but the interruption still ends the run
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_batch(&config, cancel).await;
        assert!(matches!(result, Err(ArchiverError::Interrupted)));
        Ok(())
    }

    #[tokio::test]
    async fn test_transfer_failure_aborts_only_its_batch() -> Result<()> {
        let first = Fixture::new(&[("a.txt", b"hello\n")])?;
        let second = Fixture::new(&[("b.txt", b"world\n")])?;

        // A store root that is a regular file fails every upload
        let blocked = first.dir.path().join("not-a-dir");
        fs::write(&blocked, b"")?;
        let mut broken = first.config(first.write_manifest(&[(HELLO_MD5, "a.txt")])?);
        broken.storage_root = Some(blocked);
        let working = second.config(second.write_manifest(&[(WORLD_MD5, "b.txt")])?);

        let stats_file = first.dir.path().join("stats.csv");
        let stats = run_batches(&[broken, working], &stats_file, CancellationToken::new()).await?;

        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].failed_deposits, 1);
        assert_eq!(stats[0].successful_deposits, 0);
        assert_eq!(stats[1].successful_deposits, 1);
        assert!(second.store().join("bucket/manifests/b.txt").is_file());

        let rows = read_rows(&stats_file)?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["failed_deposits"], "1");
        assert_eq!(rows[1]["successful_deposits"], "1");
        Ok(())
    }

    #[tokio::test]
    async fn test_interruption_stops_every_batch() -> Result<()> {
        let fixture = Fixture::new(&[("a.txt", b"hello\n")])?;
        let manifest = fixture.write_manifest(&[(HELLO_MD5, "a.txt")])?;
        let config = fixture.config(manifest);
        let stats_file = fixture.dir.path().join("stats.csv");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_batches(&[config.clone(), config], &stats_file, cancel).await;

        assert!(matches!(result, Err(ArchiverError::Interrupted)));
        assert!(!stats_file.exists());
        assert!(!fixture.store().exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_dry_run_is_not_completion() -> Result<()> {
        let fixture = Fixture::new(&[("a.txt", b"hello\n")])?;
        let manifest = fixture.write_manifest(&[(HELLO_MD5, "a.txt")])?;
        let mut config = fixture.config(manifest);
        config.dry_run = true;
        config.storage_root = None;

        let stats = run_batch(&config, CancellationToken::new()).await?;
        assert_eq!(stats.successful_deposits, 1);
        assert_eq!(stats.asset_bytes_transmitted, 6);

        let rows = read_rows(&fixture.results())?;
        assert_eq!(rows[0]["RESULT"], RESULT_DRY_RUN);
        assert_eq!(rows[0]["ETAG"], "DRY_RUN");
        assert!(!fixture.store().exists());

        // A dry run never blocks the real deposit
        let again = run_batch(&config, CancellationToken::new()).await?;
        assert_eq!(again.assets_ignored, 0);
        assert_eq!(again.assets_transmitted, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_single_asset_uses_file_name_as_key() -> Result<()> {
        let fixture = Fixture::new(&[("photo.tif", b"hello\n")])?;
        let mut config = fixture.config(PathBuf::new());
        config.source = AssetSource::SingleAsset(fixture.data("photo.tif"));
        config.asset_root = None;
        config.log_dir = fixture.dir.path().join("single-logs");

        let stats = run_batch(&config, CancellationToken::new()).await?;
        assert_eq!(stats.total_assets, 1);
        assert_eq!(stats.successful_deposits, 1);
        assert!(fixture.store().join("bucket/photo.tif").is_file());

        let rows = read_rows(&config.log_dir.join(RESULTS_FILE))?;
        assert_eq!(rows[0]["KEYPATH"], "photo.tif");
        assert_eq!(rows[0]["MD5"], HELLO_MD5);
        Ok(())
    }

    #[tokio::test]
    async fn test_load_batch_hashes_off_runtime_and_honours_cancel() -> Result<()> {
        let fixture = Fixture::new(&[("photo.tif", b"hello\n")])?;
        let mut config = fixture.config(PathBuf::new());
        config.source = AssetSource::SingleAsset(fixture.data("photo.tif"));
        config.asset_root = None;

        let batch = Batch::new("bucket", None, None)?;
        let loaded =
            load_batch(&config, Manifest::SingleAsset, batch, &CancellationToken::new()).await?;
        assert_eq!(loaded.contents[0].md5, HELLO_MD5);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let batch = Batch::new("bucket", None, None)?;
        let result = load_batch(&config, Manifest::SingleAsset, batch, &cancel).await;
        assert!(matches!(result, Err(ArchiverError::Interrupted)));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_storage_root_is_config_error() -> Result<()> {
        let fixture = Fixture::new(&[("a.txt", b"hello\n")])?;
        let manifest = fixture.write_manifest(&[(HELLO_MD5, "a.txt")])?;
        let mut config = fixture.config(manifest);
        config.storage_root = None;

        let result = run_batch(&config, CancellationToken::new()).await;
        assert!(matches!(result, Err(ArchiverError::Config(_))));
        assert!(!fixture.results().exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_and_out_of_scope_assets_are_counted() -> Result<()> {
        let fixture = Fixture::new(&[("a.txt", b"hello\n")])?;
        let outside = TempDir::new()?;
        let stray = outside.path().join("stray.txt");
        fs::write(&stray, b"world\n")?;

        let manifest = fixture.dir.path().join("manifests/manifest.txt");
        fs::write(
            &manifest,
            format!(
                "{} {}\n{} {}\n{} {}\n",
                HELLO_MD5,
                fixture.data("a.txt").display(),
                WORLD_MD5,
                fixture.data("gone.txt").display(),
                WORLD_MD5,
                stray.display()
            ),
        )?;

        let stats = run_batch(&fixture.config(manifest), CancellationToken::new()).await?;
        assert_eq!(stats.total_assets, 3);
        assert_eq!(stats.assets_found, 1);
        assert_eq!(stats.assets_missing, 1);
        assert_eq!(stats.assets_ignored, 1);
        assert_eq!(stats.successful_deposits, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_manifest_etag_is_trusted() -> Result<()> {
        let fixture = Fixture::new(&[("a.txt", b"hello\n")])?;
        let header = crate::manifest::inventory::HEADER.join(",");
        let row = format!(
            "Batch7,{},{},a.txt,a.txt,TXT,6,0,,{},,",
            fixture.data("a.txt").display(),
            fixture.dir.path().join("data").display(),
            HELLO_MD5
        );
        let manifest = fixture.dir.path().join("manifests/inventory.csv");
        fs::write(&manifest, format!("{},ETAG\n{},not-the-real-etag\n", header, row))?;

        let mut config = fixture.config(manifest);
        config.etag_expected = true;

        // The supplied value is used as-is, so the store's real ETag disagrees
        let stats = run_batch(&config, CancellationToken::new()).await?;
        assert_eq!(stats.failed_deposits, 1);

        let rows = read_rows(&fixture.results())?;
        assert_eq!(rows[0]["KEYPATH"], "Batch7/a.txt");
        assert_eq!(rows[0]["ETAG"], HELLO_MD5);
        assert_eq!(rows[0]["RESULT"], RESULT_FAILED);
        assert_eq!(rows[0]["BATCH"], "Batch7");
        Ok(())
    }

    #[test]
    fn test_resolve_log_dir() -> Result<()> {
        let dir = TempDir::new()?;
        let manifest_path = dir.path().join("m.txt");
        fs::write(&manifest_path, "")?;
        let manifest = detect(Some(&manifest_path))?;

        assert_eq!(resolve_log_dir(Path::new("logs"), &manifest)?, dir.path().join("logs"));
        assert_eq!(
            resolve_log_dir(Path::new("/var/log/x"), &manifest)?,
            PathBuf::from("/var/log/x")
        );
        Ok(())
    }
}
