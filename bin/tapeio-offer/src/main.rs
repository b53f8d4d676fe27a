//! TapeIO Offer - tape library storage offer daemon
//!
//! Stages written objects, packs them into tars for the tape write queue,
//! and serves access requests from the archive cache.

mod runtime;

use anyhow::{Context, Result};
use clap::Parser;
use runtime::OfferRuntime;
use std::path::{Path, PathBuf};
use tapeio_common::OfferConfig;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tapeio-offer")]
#[command(about = "TapeIO tape library storage offer")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "TAPEIO_CONFIG", default_value = "/etc/tapeio/offer.toml")]
    config: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn load_config(path: &Path) -> Result<OfferConfig> {
    if !path.exists() {
        info!("No config file at {}, using defaults", path.display());
        return Ok(OfferConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("Invalid config file {}", path.display()))
}

fn init_logging(args: &Args) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if args.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting TapeIO offer");
    let config = load_config(&args.config)?;
    info!("Input files: {}", config.storage.input_files_dir.display());
    info!("Input tars: {}", config.storage.input_tars_dir.display());
    info!(
        "Archive cache: {} ({} bytes max)",
        config.storage.cache_dir.display(),
        config.cache.max_storage_space
    );

    let runtime = OfferRuntime::build(&config).context("Failed to initialize offer")?;
    runtime.start().context("Bootstrap recovery failed")?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    runtime.shutdown();

    info!("TapeIO offer shut down gracefully");
    Ok(())
}
