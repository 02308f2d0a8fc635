//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod batch;
mod cache;
mod report;
mod run;

pub use cache::CacheCommands;

use anyhow::Result;
use clap::Subcommand;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a single simulation
    Run(run::RunArgs),
    /// Run every job in a manifest on worker threads
    Batch {
        /// Path to the JSON manifest
        manifest: PathBuf,

        /// Worker thread count
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Run a manifest concurrently, reporting jobs as they finish
    Stream {
        /// Path to the JSON manifest
        manifest: PathBuf,

        /// Maximum simulations in flight
        #[arg(short, long)]
        concurrent: Option<usize>,

        /// Stop after this many results
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Result cache management
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
///
/// # Arguments
/// * `command` - The command to execute
/// * `config` - The CLI configuration
///
/// # Returns
/// Result indicating success or failure
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Run(args) => run::handle_run_command(args, config).await,
        Commands::Batch { manifest, workers } => {
            batch::handle_batch_command(&manifest, workers, config).await
        }
        Commands::Stream {
            manifest,
            concurrent,
            limit,
        } => batch::handle_stream_command(&manifest, concurrent, limit, config).await,
        Commands::Cache { command } => cache::handle_cache_command(command, config).await,
    }
}

/// Token cancelled on the first Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping running simulations");
            trigger.cancel();
        }
    });

    cancel
}
