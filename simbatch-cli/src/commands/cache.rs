//! Cache command handlers

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use simbatch_core::Job;
use std::path::PathBuf;

use crate::config::Config;

/// Cache subcommands
#[derive(Subcommand)]
pub enum CacheCommands {
    /// List cached entries
    List,
    /// Remove every cached entry
    Clear,
    /// Print the cache key a job would use
    Key {
        /// Model file
        #[arg(long)]
        model: PathBuf,

        /// Weather file
        #[arg(long)]
        weather: Option<PathBuf>,
    },
}

/// Handle cache commands
///
/// # Arguments
/// * `command` - The cache command to execute
/// * `config` - The CLI configuration
pub async fn handle_cache_command(command: CacheCommands, config: &Config) -> Result<()> {
    let runner = config.runner()?;

    match command {
        CacheCommands::List => {
            let cache = runner.cache().context("The result cache is disabled")?;
            let keys = cache.keys()?;
            if keys.is_empty() {
                println!("{}", "No cached results.".yellow());
            } else {
                println!(
                    "{}",
                    format!("{} cached result(s) in {}:", keys.len(), cache.root().display())
                        .bold()
                );
                for key in keys {
                    println!("  {} {}", "▸".cyan(), key);
                }
            }
        }
        CacheCommands::Clear => {
            let cache = runner.cache().context("The result cache is disabled")?;
            cache.clear()?;
            println!("{} Cleared {}", "✓".green(), cache.root().display());
        }
        CacheCommands::Key { model, weather } => {
            let mut builder = Job::builder(model);
            if let Some(weather) = weather {
                builder = builder.weather(weather);
            }
            let key = runner.cache_key(&builder.build()?)?;
            println!("{}", key);
        }
    }

    Ok(())
}
