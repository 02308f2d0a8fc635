//! Error types for the runner

use simbatch_core::ConfigurationError;
use simbatch_storage::StorageError;
use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;
use crate::executor::ExecutorError;

/// Errors surfaced by the single-job runner and the batch schedulers
///
/// Engine failures (non-zero exit, timeout, failed preprocessing) are not
/// errors: they are recorded in the returned `SimResult`.
#[derive(Debug, Error)]
pub enum RunError {
    /// The job is malformed
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// The runner configuration is invalid
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The engine executable does not exist
    #[error("engine executable not found: {}", .0.display())]
    EngineNotFound(PathBuf),

    /// Reading inputs or publishing outputs failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The run directory could not be created or staged
    #[error("failed to prepare run directory {}: {source}", path.display())]
    RunDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The engine could not be launched
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// The run was cancelled before producing a result
    #[error("run cancelled")]
    Cancelled,

    /// A background task failed
    #[error("background task failed: {0}")]
    Task(String),
}

impl RunError {
    pub(crate) fn run_dir(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::RunDirectory {
            path: path.into(),
            source,
        }
    }

    /// Whether this error prevents any job in a batch from running
    pub fn is_process_wide(&self) -> bool {
        matches!(
            self,
            RunError::Config(_) | RunError::EngineNotFound(_) | RunError::RunDirectory { .. }
        )
    }
}

/// Errors from the result cache
///
/// Callers treat these as soft: a failed lookup is a miss, a failed write is
/// logged and skipped.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("cache entry {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("failed to encode cache entry: {0}")]
    Encode(#[from] serde_json::Error),
}
