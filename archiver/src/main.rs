//! Archiver - Main entry point
//!
//! Deposits batches of files to object storage and verifies every upload.

use anyhow::Result;
use archiver::config::{BatchSpec, BatchesFile, Config, DepositConfig};
use archiver::shutdown::ShutdownCoordinator;
use archiver::{run_batches, utils, ArchiverError};
use clap::{ArgGroup, Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about = "Preservation archiver for object storage", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Append batch statistics to this CSV file (overrides config)
    #[arg(long, value_name = "FILE", global = true)]
    stats_file: Option<PathBuf>,

    /// Root directory of the object store (overrides config)
    #[arg(long, value_name = "DIR", global = true)]
    storage_root: Option<PathBuf>,

    /// Verify the reconciliation logic without sending anything
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deposit a batch of resources
    #[command(visible_alias = "dep")]
    Deposit(DepositArgs),

    /// Deposit every batch listed in a TOML file
    BatchDeposit {
        /// File with one [[batch]] table per batch
        #[arg(short = 'f', long, value_name = "FILE")]
        batches_file: PathBuf,
    },
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("source").required(true).args(["mapfile", "asset"])))]
struct DepositArgs {
    /// Bucket to deposit files into
    #[arg(short, long)]
    bucket: String,

    /// Chunk size for multipart uploads, e.g. 8MB or 4GB
    #[arg(short, long)]
    chunk: Option<String>,

    /// Location to store log files
    #[arg(short, long, value_name = "DIR")]
    logs: Option<PathBuf>,

    /// Batch identifier or name
    #[arg(short, long)]
    name: Option<String>,

    /// Root dir of files being archived
    #[arg(short, long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Storage class
    #[arg(short, long)]
    storage: Option<String>,

    /// Maximum number of concurrent part transfers
    #[arg(short, long)]
    threads: Option<usize>,

    /// Archive the assets listed in a manifest
    #[arg(short, long, value_name = "FILE")]
    mapfile: Option<PathBuf>,

    /// Archive a single asset
    #[arg(short, long, value_name = "FILE")]
    asset: Option<PathBuf>,

    /// Trust the ETAG column of inventory manifests instead of recomputing
    #[arg(long)]
    etag_expected: bool,
}

impl From<DepositArgs> for BatchSpec {
    fn from(args: DepositArgs) -> Self {
        BatchSpec {
            bucket: args.bucket,
            manifest: args.mapfile,
            asset: args.asset,
            asset_root: args.root,
            name: args.name,
            chunk_size: args.chunk,
            storage_class: args.storage,
            max_concurrency: args.threads,
            log_dir: args.logs,
            etag_expected: args.etag_expected,
            dry_run: false,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("archiver: {:#}", e);
            let code = e
                .downcast_ref::<ArchiverError>()
                .map(ArchiverError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(root) = cli.storage_root {
        config.storage.root = Some(root);
    }

    // Initialize logging
    let log_level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("Starting archiver v{}", env!("CARGO_PKG_VERSION"));

    let specs = match cli.command {
        Command::Deposit(args) => vec![BatchSpec::from(args)],
        Command::BatchDeposit { batches_file } => BatchesFile::from_file(&batches_file)?.batches,
    };

    // Every batch is validated before the first transfer
    let deposits = specs
        .into_iter()
        .map(|mut spec| {
            spec.dry_run |= cli.dry_run;
            DepositConfig::resolve(&spec, &config)
        })
        .collect::<archiver::Result<Vec<_>>>()?;
    let stats_file = cli.stats_file.unwrap_or_else(|| config.deposit.stats_file.clone());

    let shutdown = ShutdownCoordinator::new();
    let listener = shutdown.clone();
    let signal_handle = tokio::spawn(async move { listener.wait_for_signal().await });

    let result = run_batches(&deposits, &stats_file, shutdown.token()).await;
    signal_handle.abort();
    result?;
    Ok(())
}
