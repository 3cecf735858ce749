use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{debug, info};

use finspect::config::{FinspectConfig, InitialWatchPath};
use finspect::logging::init_logging;
use finspect::pipeline::Pipeline;
use finspect::workers::default_workers;

#[derive(Parser)]
#[command(name = "finspect-server")]
#[command(about = "Watch directories and run index/ingest jobs for every change", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML); defaults are used when it does not exist
    #[arg(long, default_value = ".finspect/config.toml")]
    config: PathBuf,

    /// Override the database location from the configuration
    #[arg(long)]
    db: Option<PathBuf>,

    /// Additional path to watch (repeatable)
    #[arg(long)]
    watch: Vec<PathBuf>,

    /// Watch the --watch paths without descending into subdirectories
    #[arg(long)]
    non_recursive: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = FinspectConfig::load(&cli.config)?;
    if let Some(db) = cli.db {
        config.storage.db_path = db;
    }
    config
        .watcher
        .paths
        .extend(cli.watch.into_iter().map(|path| InitialWatchPath {
            path,
            recursive: !cli.non_recursive,
        }));

    let _log_guards = init_logging(&config.logging)?;

    info!("🚀 Starting finspect {}", env!("CARGO_PKG_VERSION"));
    info!(
        "📝 Logging enabled - Console output + File output to {}",
        config.logging.directory.join("finspect.log").display()
    );
    debug!("Configuration: {:?}", config);

    let pipeline =
        Pipeline::open(config, default_workers()).context("Failed to open the pipeline")?;
    pipeline.start().context("Failed to start the pipeline")?;

    for watch_path in pipeline.list_watch_paths() {
        info!("👀 Watching {} ({})", watch_path.path.display(), watch_path.id);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    pipeline.shutdown().await?;
    info!("👋 finspect stopped");
    Ok(())
}
