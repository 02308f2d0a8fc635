//! Simbatch CLI
//!
//! Command-line interface for running building energy simulations, one at a
//! time or in cached, parallel batches.

mod commands;
mod config;
mod manifest;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "simbatch")]
#[command(about = "Cached batch runner for EnergyPlus simulations", long_about = None)]
struct Cli {
    /// Engine executable
    #[arg(long, global = true, env = "SIMBATCH_ENGINE", default_value = "energyplus")]
    engine: PathBuf,

    /// Engine version (salts cache keys)
    #[arg(long, global = true, env = "SIMBATCH_ENGINE_VERSION", default_value = "unknown")]
    engine_version: String,

    /// Base directory for run directories
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    /// Result cache directory
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Disable the result cache
    #[arg(long, global = true)]
    no_cache: bool,

    /// Expand HVAC templates before running
    #[arg(long, global = true)]
    expand_objects: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "simbatch=info,simbatch_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = Config {
        engine: cli.engine,
        engine_version: cli.engine_version,
        work_dir: cli.work_dir,
        cache_dir: cli.cache_dir,
        no_cache: cli.no_cache,
        expand_objects: cli.expand_objects,
    };

    handle_command(cli.command, &config).await
}
