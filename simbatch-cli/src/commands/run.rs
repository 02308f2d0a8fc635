//! Single simulation command

use anyhow::{Context, Result, bail};
use clap::Args;
use simbatch_core::Job;
use std::path::PathBuf;
use std::time::Duration;

use super::{cancel_on_ctrl_c, report};
use crate::config::Config;

#[derive(Args)]
pub struct RunArgs {
    /// Model file (.idf or .epJSON)
    #[arg(long)]
    model: PathBuf,

    /// Weather file (.epw)
    #[arg(long)]
    weather: Option<PathBuf>,

    /// Label for the run directory; defaults to the model file stem
    #[arg(long)]
    label: Option<String>,

    /// Copy outputs here after a successful run
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Annual simulation over the weather period
    #[arg(long)]
    annual: bool,

    /// Design-day only simulation
    #[arg(long)]
    design_day: bool,

    /// Run ReadVarsESO after the simulation
    #[arg(long)]
    readvars: bool,

    /// Wall-clock limit in seconds
    #[arg(long)]
    timeout: Option<u64>,
}

impl RunArgs {
    fn into_job(self) -> Result<Job> {
        let mut builder = Job::builder(self.model)
            .annual(self.annual)
            .design_day(self.design_day)
            .readvars(self.readvars);

        if let Some(weather) = self.weather {
            builder = builder.weather(weather);
        }
        if let Some(label) = self.label {
            builder = builder.label(label);
        }
        if let Some(dir) = self.output_dir {
            builder = builder.output_dir(dir);
        }
        if let Some(secs) = self.timeout {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        Ok(builder.build()?)
    }
}

/// Runs one job on a blocking thread so Ctrl-C stays responsive
pub async fn handle_run_command(args: RunArgs, config: &Config) -> Result<()> {
    let job = args.into_job()?;
    let runner = config.runner()?;
    let cancel = cancel_on_ctrl_c();

    let result = tokio::task::spawn_blocking(move || runner.run_with_cancel(&job, &cancel))
        .await
        .context("Simulation thread panicked")??;

    report::print_details(&result);

    if !result.success() {
        bail!("Simulation '{}' failed", result.label());
    }
    Ok(())
}
