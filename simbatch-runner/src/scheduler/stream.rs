//! Async batch runner
//!
//! Runs jobs as tasks on the current tokio runtime, bounded by a semaphore,
//! and publishes a [`StreamEvent`] per job in completion order through a
//! bounded channel. Dropping or closing the [`EventStream`] cancels every
//! job still pending or running.

use futures::FutureExt;
use futures::Stream;
use simbatch_core::{BatchResult, Job, SimResult, StreamEvent};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{cancelled_result, error_result, panic_result};
use crate::error::RunError;
use crate::runner::SimulationRunner;

/// Time cancelled jobs get to stop their engines before being aborted
const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Runs jobs concurrently on the async runtime
pub struct AsyncBatchRunner {
    runner: Arc<SimulationRunner>,
    max_concurrent: usize,
    channel_capacity: usize,
    cancel: CancellationToken,
}

impl AsyncBatchRunner {
    pub fn new(runner: Arc<SimulationRunner>) -> Self {
        let max_concurrent = runner.config().max_concurrent;
        let channel_capacity = runner.config().channel_capacity;
        Self {
            runner,
            max_concurrent,
            channel_capacity,
            cancel: CancellationToken::new(),
        }
    }

    /// Jobs in flight at once
    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    /// Completed events buffered ahead of the consumer
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Parent token; cancelling it cancels every stream started from here
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Starts every job and returns their events in completion order
    ///
    /// Must be called from within a tokio runtime.
    pub fn stream(&self, jobs: Vec<Job>) -> Result<EventStream, RunError> {
        self.runner.validate()?;
        Ok(self.spawn(jobs))
    }

    /// Runs every job and returns the results in submission order
    pub async fn gather(&self, jobs: Vec<Job>) -> Result<BatchResult, RunError> {
        self.runner.validate()?;

        let started = Instant::now();
        let labels: Vec<String> = jobs.iter().map(|job| job.label().to_string()).collect();
        let mut events = self.spawn(jobs);

        let mut finished: BTreeMap<usize, SimResult> = BTreeMap::new();
        while let Some(event) = events.next().await {
            finished.insert(event.index, event.result);
        }

        let results = labels
            .into_iter()
            .enumerate()
            .map(|(index, label)| {
                finished
                    .remove(&index)
                    .unwrap_or_else(|| cancelled_result(label))
            })
            .collect();

        Ok(BatchResult::new(results, started.elapsed()))
    }

    fn spawn(&self, jobs: Vec<Job>) -> EventStream {
        let total = jobs.len();
        let cancel = self.cancel.child_token();
        let (tx, rx) = mpsc::channel(self.channel_capacity.max(1));

        info!(
            "Streaming {} job(s) with up to {} in flight",
            total, self.max_concurrent
        );
        let driver = tokio::spawn(drive(
            Arc::clone(&self.runner),
            jobs,
            self.max_concurrent.max(1),
            tx,
            cancel.clone(),
        ));

        EventStream {
            rx,
            cancel,
            driver: Some(driver),
            total,
        }
    }
}

/// Completion events of a running batch
///
/// Yields exactly one event per job unless cancelled. Dropping the stream
/// cancels outstanding work without waiting; [`EventStream::close`] also
/// waits until every engine has stopped.
pub struct EventStream {
    rx: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
    total: usize,
}

impl EventStream {
    /// Next completed job, `None` once every job has reported or the batch
    /// was cancelled
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Number of submitted jobs
    pub fn total(&self) -> usize {
        self.total
    }

    /// Requests cancellation of every pending and running job
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancels outstanding work and waits for it to stop
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.rx.close();
        if let Some(driver) = self.driver.take()
            && let Err(e) = driver.await
        {
            warn!("Stream driver failed: {}", e);
        }
    }
}

impl Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Schedules jobs as permits free up and forwards completions
async fn drive(
    runner: Arc<SimulationRunner>,
    jobs: Vec<Job>,
    max_concurrent: usize,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) {
    let total = jobs.len();
    let semaphore = Arc::new(Semaphore::new(max_concurrent));
    let mut pending = jobs.into_iter().enumerate();
    let mut next = pending.next();
    let mut running: JoinSet<(usize, SimResult)> = JoinSet::new();
    let mut completed = 0;

    loop {
        if next.is_none() && running.is_empty() {
            break;
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!("Stream cancelled with {} job(s) running", running.len());
                break;
            }

            Some(joined) = running.join_next(), if !running.is_empty() => {
                let (index, result) = match joined {
                    Ok(done) => done,
                    Err(e) => {
                        warn!("Job task ended abnormally: {}", e);
                        continue;
                    }
                };
                completed += 1;
                let event = StreamEvent::new(index, result, completed, total);
                tokio::select! {
                    sent = tx.send(event) => {
                        if sent.is_err() {
                            debug!("Event consumer went away");
                            break;
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }

            permit = Arc::clone(&semaphore).acquire_owned(), if next.is_some() => {
                let Ok(permit) = permit else {
                    break;
                };
                if let Some((index, job)) = next.take() {
                    let runner = Arc::clone(&runner);
                    let token = cancel.clone();
                    running.spawn(async move {
                        let _permit = permit;
                        let started = Instant::now();
                        let result = match AssertUnwindSafe(runner.run_async(&job, &token))
                            .catch_unwind()
                            .await
                        {
                            Ok(Ok(result)) => result,
                            Ok(Err(error)) => error_result(&job, error, started.elapsed()),
                            Err(panic) => panic_result(&job, panic, started.elapsed()),
                        };
                        (index, result)
                    });
                }
                next = pending.next();
            }
        }
    }

    // Ask running engines to stop, then abort whatever ignores the request
    cancel.cancel();
    if !running.is_empty() {
        let drain = async { while running.join_next().await.is_some() {} };
        if tokio::time::timeout(CANCEL_GRACE, drain).await.is_err() {
            warn!("Aborting {} job(s) that did not stop in time", running.len());
            running.shutdown().await;
        }
    }
}
