//! Batch and stream command handlers
//!
//! Both read a job manifest; `batch` reports in submission order once every
//! job is done, `stream` prints each result as soon as it finishes.

use anyhow::{Context, Result, bail};
use colored::*;
use simbatch_runner::{AsyncBatchRunner, BatchRunner};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::{cancel_on_ctrl_c, report};
use crate::config::Config;
use crate::manifest;

/// Handle `simbatch batch`
///
/// # Arguments
/// * `manifest` - Path to the job manifest
/// * `workers` - Worker thread count, the configured default when absent
/// * `config` - The CLI configuration
pub async fn handle_batch_command(
    manifest: &Path,
    workers: Option<usize>,
    config: &Config,
) -> Result<()> {
    let jobs = manifest::load(manifest)?;
    if jobs.is_empty() {
        println!("{}", "No jobs found.".yellow());
        return Ok(());
    }

    let runner = Arc::new(config.runner()?);
    let cancel = cancel_on_ctrl_c();
    println!("{}", format!("Running {} job(s):", jobs.len()).bold());

    let batch = tokio::task::spawn_blocking(move || {
        let mut batch = BatchRunner::new(&runner)
            .with_cancellation(cancel)
            .on_progress(report::print_progress);
        if let Some(workers) = workers {
            batch = batch.max_workers(workers);
        }
        batch.run(&jobs)
    })
    .await
    .context("Batch thread panicked")??;

    report::print_summary(&batch);

    if !batch.all_succeeded() {
        bail!("{} of {} job(s) failed", batch.failed(), batch.len());
    }
    Ok(())
}

/// Handle `simbatch stream`
///
/// # Arguments
/// * `manifest` - Path to the job manifest
/// * `concurrent` - Simulations in flight, the configured default when absent
/// * `limit` - Close the stream after this many results
/// * `config` - The CLI configuration
pub async fn handle_stream_command(
    manifest: &Path,
    concurrent: Option<usize>,
    limit: Option<usize>,
    config: &Config,
) -> Result<()> {
    let jobs = manifest::load(manifest)?;
    if jobs.is_empty() {
        println!("{}", "No jobs found.".yellow());
        return Ok(());
    }

    let runner = Arc::new(config.runner()?);
    let mut scheduler = AsyncBatchRunner::new(runner).with_cancellation(cancel_on_ctrl_c());
    if let Some(concurrent) = concurrent {
        scheduler = scheduler.max_concurrent(concurrent);
    }

    let mut stream = scheduler.stream(jobs)?;
    let total = stream.total();
    println!("{}", format!("Streaming {} job(s):", total).bold());

    let mut received = 0;
    let mut failed = 0;
    while let Some(event) = stream.next().await {
        report::print_progress(&event);
        received += 1;
        if !event.result.success() {
            failed += 1;
        }

        if limit.is_some_and(|limit| received >= limit) {
            info!("Received {} result(s), stopping the remaining jobs", received);
            break;
        }
    }

    let interrupted = stream.is_cancelled();
    stream.close().await;

    println!();
    println!(
        "{}",
        format!("{} of {} job(s) reported, {} failed", received, total, failed).bold()
    );

    if failed > 0 {
        bail!("{} job(s) failed", failed);
    }
    if interrupted && limit.is_none() {
        bail!("Interrupted after {} of {} job(s)", received, total);
    }
    Ok(())
}
