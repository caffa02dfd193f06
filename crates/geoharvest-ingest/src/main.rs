//! geoharvest - Mapillary collection harvester

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use geoharvest_common::format::format_size;
use geoharvest_common::logging::{init_logging, LogConfig, LogLevel};
use geoharvest_common::{CollectionName, Quality};
use geoharvest_ingest::oracle::{ArchiveOracle, InternetArchiveOracle};
use geoharvest_ingest::packager::seal_blocking;
use geoharvest_ingest::report::ProgressReporter;
use geoharvest_ingest::transform::{CwebpConverter, ExiftoolEmbedder, NoopEmbedder};
use geoharvest_ingest::{BoundingBox, HarvestConfig, Harvester, StagingLayout};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "geoharvest")]
#[command(author, version, about = "Resumable Mapillary collection harvester")]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download an account's images into a collection directory
    Harvest(HarvestArgs),

    /// Seal the date directories of a collection into tar bundles
    Seal {
        /// Collection directory
        dir: PathBuf,
    },

    /// Check whether a collection is already published on the archive
    Check {
        /// Collection name, e.g. mapillary-alice-original
        name: String,
    },
}

#[derive(clap::Args, Debug)]
struct HarvestArgs {
    /// Account (creator username) to harvest
    account: String,

    /// Parent directory for collection directories
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Image quality: 256, 1024, 2048 or original
    #[arg(short, long)]
    quality: Option<Quality>,

    /// Restrict to west,south,east,north
    #[arg(long, allow_hyphen_values = true)]
    bbox: Option<BoundingBox>,

    /// Parallel download workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Records buffered between crawl and workers
    #[arg(long)]
    queue_depth: Option<usize>,

    /// Flush the checkpoint after this many downloads
    #[arg(long)]
    flush_interval: Option<usize>,

    /// Convert images to WebP (requires cwebp)
    #[arg(long)]
    webp: bool,

    /// Gzip the metadata log
    #[arg(long)]
    compress: bool,

    /// Staging layout: sequence or date
    #[arg(long)]
    layout: Option<StagingLayout>,

    /// Seal per-day bundles once the crawl completes (implies --layout date)
    #[arg(long)]
    package: bool,

    /// Attempts per request before giving up
    #[arg(long)]
    max_retries: Option<u32>,

    /// Request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Mapillary API access token
    #[arg(long, env = "MAPILLARY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Do not embed EXIF/XMP metadata
    #[arg(long)]
    skip_metadata: bool,

    /// Do not ask the archive whether the collection already exists
    #[arg(long)]
    no_check: bool,
}

impl HarvestArgs {
    fn apply(&self, config: &mut HarvestConfig) {
        if let Some(output) = &self.output {
            config.output_root = output.clone();
        }
        if let Some(quality) = self.quality {
            config.quality = quality;
        }
        if let Some(bbox) = self.bbox {
            config.bbox = Some(bbox);
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(depth) = self.queue_depth {
            config.queue_depth = Some(depth);
        }
        if let Some(interval) = self.flush_interval {
            config.flush_interval = interval;
        }
        config.webp |= self.webp;
        config.compress_metadata |= self.compress;
        config.package |= self.package;
        match self.layout {
            Some(layout) => config.layout = layout,
            None if self.package => config.layout = StagingLayout::Date,
            None => {},
        }
        if let Some(retries) = self.max_retries {
            config.backoff.max_attempts = retries;
        }
        if let Some(secs) = self.timeout {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(token) = self.token.as_ref().filter(|t| !t.trim().is_empty()) {
            config.token = Some(token.clone());
        }
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env().unwrap_or_default();
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }
    // Keep the guard alive so buffered file logs are flushed on exit
    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Warning: logging disabled: {e:#}");
            None
        },
    };

    if let Err(e) = execute_command(cli.command).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn execute_command(command: Commands) -> Result<()> {
    match command {
        Commands::Harvest(args) => harvest(args).await,
        Commands::Seal { dir } => seal(dir).await,
        Commands::Check { name } => check(&name).await,
    }
}

async fn harvest(args: HarvestArgs) -> Result<()> {
    let mut config = HarvestConfig::from_env().context("Invalid environment configuration")?;
    args.apply(&mut config);
    if config.token.is_none() {
        warn!("No access token set; the API will likely reject requests");
    }

    let collection = config.collection_name(&args.account).to_string();
    let reporter = Arc::new(ProgressReporter::new(&format!("Harvesting {collection}")));
    let archive_url = config.archive_base_url.clone();
    let webp = config.webp;

    let mut harvester = Harvester::new(config, args.account.as_str())?.with_reporter(reporter);

    if args.skip_metadata {
        harvester = harvester.with_embedder(Arc::new(NoopEmbedder));
    } else if let Some(exiftool) = ExiftoolEmbedder::from_path() {
        harvester = harvester.with_embedder(Arc::new(exiftool));
    } else {
        warn!("exiftool not found on PATH, images will not be tagged");
    }

    if webp {
        let cwebp = CwebpConverter::from_path()
            .context("WebP output requested but cwebp was not found on PATH")?;
        harvester = harvester.with_converter(Arc::new(cwebp));
    }

    if !args.no_check {
        harvester = harvester.with_oracle(Arc::new(InternetArchiveOracle::new(archive_url)?));
    }

    let cancel = harvester.cancellation_token();
    tokio::spawn(cancel_on_signal(cancel));

    let report = harvester.run().await?;
    println!("{report}");
    Ok(())
}

async fn seal(dir: PathBuf) -> Result<()> {
    let report = seal_blocking(dir.clone())
        .await
        .with_context(|| format!("Failed to seal {}", dir.display()))?;

    for bundle in &report.bundles {
        println!(
            "{}  {}  {} files  {}",
            bundle.sha256,
            bundle.path.display(),
            bundle.files,
            format_size(bundle.bytes)
        );
    }
    for (name, reason) in &report.failed {
        eprintln!("Failed to seal {name}: {reason}");
    }
    println!(
        "Sealed {} bundles, {} files, {}",
        report.bundles_created(),
        report.files_sealed,
        format_size(report.total_bytes())
    );

    if report.failed.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} directories could not be sealed", report.failed.len())
    }
}

async fn check(name: &str) -> Result<()> {
    if let Err(e) = CollectionName::parse(name) {
        warn!(name = %name, error = %e, "Name does not look like a collection name");
    }
    let config = HarvestConfig::from_env().context("Invalid environment configuration")?;
    let oracle = InternetArchiveOracle::new(config.archive_base_url)?;

    if oracle.exists(name).await {
        println!("{name}: published");
    } else {
        println!("{name}: not found");
    }
    Ok(())
}

/// Cancel the harvest on Ctrl+C or SIGTERM
async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, finishing in-flight downloads"),
        _ = terminate => info!("Received terminate signal, finishing in-flight downloads"),
    }
    cancel.cancel();
}
