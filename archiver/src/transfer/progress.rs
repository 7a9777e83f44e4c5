//! Byte-level progress tracking for deposits.
//!
//! Storage backends report bytes as deltas, possibly from several part
//! uploads at once. [`ProgressTracker::callback`] turns a shared tracker
//! into the callback they expect; the deposit driver reads the totals back
//! after each asset.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::storage::ProgressCallback;

/// Snapshot of a batch transfer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferProgress {
    /// Bytes of all assets in the batch.
    pub total_bytes: u64,

    /// Bytes sent so far, across assets.
    pub transferred_bytes: u64,

    /// Bytes sent for the asset currently in flight.
    pub asset_bytes: u64,

    /// Percentage complete (0-100)
    pub percent_complete: f64,

    pub assets_processed: usize,
    pub total_assets: usize,

    /// Key of the asset being sent.
    pub current_asset: Option<String>,
}

impl TransferProgress {
    pub fn new(total_bytes: u64, total_assets: usize) -> Self {
        Self {
            total_bytes,
            total_assets,
            ..Default::default()
        }
    }

    fn add(&mut self, delta: u64) {
        self.transferred_bytes += delta;
        self.asset_bytes += delta;
        self.percent_complete = if self.total_bytes > 0 {
            (self.transferred_bytes as f64 / self.total_bytes as f64) * 100.0
        } else {
            0.0
        };
    }

    pub fn is_complete(&self) -> bool {
        self.transferred_bytes >= self.total_bytes
    }
}

/// Progress tracker with time-based speed calculation.
#[derive(Debug)]
pub struct ProgressTracker {
    start_time: Instant,
    last_report: u64,
    progress: TransferProgress,
}

/// A tracker shared with a storage backend.
pub type SharedProgress = Arc<Mutex<ProgressTracker>>;

impl ProgressTracker {
    pub fn new(total_bytes: u64, total_assets: usize) -> Self {
        Self {
            start_time: Instant::now(),
            last_report: 0,
            progress: TransferProgress::new(total_bytes, total_assets),
        }
    }

    pub fn shared(total_bytes: u64, total_assets: usize) -> SharedProgress {
        Arc::new(Mutex::new(Self::new(total_bytes, total_assets)))
    }

    /// Starts counting a new asset.
    pub fn begin_asset(&mut self, key: &str) {
        self.progress.asset_bytes = 0;
        self.progress.current_asset = Some(key.to_string());
    }

    /// Finishes the current asset, returning the bytes sent for it.
    pub fn finish_asset(&mut self) -> u64 {
        self.progress.assets_processed += 1;
        self.progress.current_asset = None;
        std::mem::take(&mut self.progress.asset_bytes)
    }

    /// Adds `delta` bytes.
    pub fn record(&mut self, delta: u64) -> &TransferProgress {
        self.progress.add(delta);

        // One debug line per whole percent
        let percent = self.progress.percent_complete as u64;
        if percent > self.last_report {
            self.last_report = percent;
            debug!(
                "Transferred {} of {} ({}%, {})",
                format_bytes(self.progress.transferred_bytes),
                format_bytes(self.progress.total_bytes),
                percent,
                format_speed(self.average_speed())
            );
        }
        &self.progress
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average speed since start, in bytes per second.
    pub fn average_speed(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.progress.transferred_bytes as f64 / elapsed) as u64
        } else {
            0
        }
    }

    pub fn progress(&self) -> &TransferProgress {
        &self.progress
    }

    /// Callback that feeds byte deltas into `tracker`.
    pub fn callback(tracker: &SharedProgress) -> ProgressCallback {
        let tracker = Arc::clone(tracker);
        Arc::new(move |delta: u64| {
            tracker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record(delta);
        })
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
