//! Blocking batch runner
//!
//! Runs jobs on a bounded pool of scoped worker threads. Workers pull the
//! next job index from a shared cursor and report `(index, result)` pairs
//! back over a channel; results are reassembled in submission order.

use simbatch_core::{BatchResult, Job, SimResult, StreamEvent};
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{cancelled_result, error_result, panic_result};
use crate::error::RunError;
use crate::runner::SimulationRunner;

type ProgressFn<'a> = Box<dyn Fn(&StreamEvent) + Send + Sync + 'a>;

/// Runs a list of jobs on worker threads
pub struct BatchRunner<'a> {
    runner: &'a SimulationRunner,
    max_workers: usize,
    cancel: CancellationToken,
    on_progress: Option<ProgressFn<'a>>,
}

impl<'a> BatchRunner<'a> {
    pub fn new(runner: &'a SimulationRunner) -> Self {
        Self {
            runner,
            max_workers: runner.config().max_workers,
            cancel: CancellationToken::new(),
            on_progress: None,
        }
    }

    /// Worker thread count; capped at the number of jobs
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Jobs not yet started when `cancel` fires come back cancelled, and
    /// running engines are terminated
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Called on the submitting thread as each job completes
    pub fn on_progress(mut self, callback: impl Fn(&StreamEvent) + Send + Sync + 'a) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    /// Runs every job and returns one result per job, in submission order
    ///
    /// Fails only when no job could run at all (missing engine, unusable
    /// configuration). Per-job failures are recorded in their results.
    pub fn run(&self, jobs: &[Job]) -> Result<BatchResult, RunError> {
        self.runner.validate()?;

        let started = Instant::now();
        let total = jobs.len();
        if total == 0 {
            return Ok(BatchResult::new(Vec::new(), started.elapsed()));
        }

        let workers = self.max_workers.min(total);
        info!("Running {} job(s) on {} worker(s)", total, workers);

        let cursor = AtomicUsize::new(0);
        let mut finished: BTreeMap<usize, SimResult> = BTreeMap::new();

        std::thread::scope(|scope| {
            let (tx, rx) = mpsc::channel::<(usize, SimResult)>();

            for worker in 0..workers {
                let tx = tx.clone();
                let cursor = &cursor;
                scope.spawn(move || {
                    loop {
                        let index = cursor.fetch_add(1, Ordering::SeqCst);
                        let Some(job) = jobs.get(index) else {
                            break;
                        };
                        debug!("Worker {} picked job {} ({})", worker, index, job.label());
                        let result = self.run_one(job);
                        if tx.send((index, result)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);

            for (index, result) in rx {
                if let Some(callback) = &self.on_progress {
                    let event = StreamEvent::new(index, result.clone(), finished.len() + 1, total);
                    callback(&event);
                }
                finished.insert(index, result);
            }
        });

        let results = jobs
            .iter()
            .enumerate()
            .map(|(index, job)| {
                finished
                    .remove(&index)
                    .unwrap_or_else(|| cancelled_result(job.label()))
            })
            .collect::<Vec<_>>();

        let batch = BatchResult::new(results, started.elapsed());
        info!(
            "Batch finished: {} succeeded, {} failed in {:.2}s",
            batch.succeeded(),
            batch.failed(),
            batch.runtime().as_secs_f64()
        );
        Ok(batch)
    }

    fn run_one(&self, job: &Job) -> SimResult {
        if self.cancel.is_cancelled() {
            return cancelled_result(job.label());
        }

        let started = Instant::now();
        match catch_unwind(AssertUnwindSafe(|| {
            self.runner.run_with_cancel(job, &self.cancel)
        })) {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => error_result(job, error, started.elapsed()),
            Err(panic) => panic_result(job, panic, started.elapsed()),
        }
    }
}

/// Runs `jobs` with at most `max_workers` in parallel
pub fn simulate_batch(
    runner: &SimulationRunner,
    jobs: &[Job],
    max_workers: usize,
) -> Result<BatchResult, RunError> {
    BatchRunner::new(runner).max_workers(max_workers).run(jobs)
}
