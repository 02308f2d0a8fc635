//! Scheduler layer for the runner
//!
//! This layer fans a list of jobs out over the single-job runner:
//! - `batch`: worker threads, results in submission order
//! - `stream`: async tasks, events in completion order

pub mod batch;
pub mod stream;

pub use batch::{BatchRunner, simulate_batch};
pub use stream::{AsyncBatchRunner, EventStream};

use simbatch_core::{FailureReason, Job, SimResult};
use std::any::Any;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::error::RunError;

/// Folds a runner error into a failed result, so one bad job never takes
/// the batch down
pub(crate) fn error_result(job: &Job, error: RunError, runtime: Duration) -> SimResult {
    let reason = match error {
        RunError::Cancelled => FailureReason::Cancelled,
        error => {
            warn!("Job {} failed to run: {}", job.label(), error);
            FailureReason::Error {
                message: error.to_string(),
            }
        }
    };
    SimResult::failed(job.label(), PathBuf::new(), reason, runtime)
}

pub(crate) fn panic_result(job: &Job, panic: Box<dyn Any + Send>, runtime: Duration) -> SimResult {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    warn!("Job {} panicked: {}", job.label(), message);
    let reason = FailureReason::Error {
        message: format!("runner panicked: {}", message),
    };
    SimResult::failed(job.label(), PathBuf::new(), reason, runtime)
}

/// Placeholder for a job that never started
pub(crate) fn cancelled_result(label: impl Into<String>) -> SimResult {
    SimResult::failed(label, PathBuf::new(), FailureReason::Cancelled, Duration::ZERO)
}
