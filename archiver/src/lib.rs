//! Archiver Library
//!
//! Deposits local files to object storage, verifying each upload against a
//! locally computed multipart ETag and recording the outcome in a results
//! ledger so interrupted runs can resume.

pub mod asset;
pub mod batch;
pub mod config;
pub mod deposit;
pub mod fingerprint;
pub mod ledger;
pub mod manifest;
pub mod shutdown;
pub mod storage;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use batch::{Batch, BatchStats};
pub use config::{Config, DepositConfig};
pub use deposit::{run_batch, run_batches, Depositor};
pub use fingerprint::{composite_digest, whole_file_digest, EtagCalculator};
pub use manifest::{detect, Manifest};
pub use utils::errors::{ArchiverError, AssetError};
pub type Result<T> = std::result::Result<T, ArchiverError>;
