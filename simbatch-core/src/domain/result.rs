//! Result domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::cache_key::CacheKey;

/// Why a run did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The engine exited with a non-zero status
    NonZeroExit { code: i32 },

    /// The engine was terminated without an exit code (signal)
    Terminated,

    /// The run exceeded its wall-clock limit and was killed
    Timeout {
        #[serde(with = "super::secs")]
        limit: Duration,
    },

    /// A preprocessing step failed before the engine started
    Preprocess { step: String, message: String },

    /// The run was cancelled before it finished
    Cancelled,

    /// The runner failed around the engine (staging, storage, panics)
    Error { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NonZeroExit { code } => write!(f, "exited with code {}", code),
            FailureReason::Terminated => write!(f, "terminated by signal"),
            FailureReason::Timeout { limit } => write!(f, "timed out after {:?}", limit),
            FailureReason::Preprocess { step, message } => {
                write!(f, "preprocessing step '{}' failed: {}", step, message)
            }
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::Error { message } => write!(f, "{}", message),
        }
    }
}

/// Raw outcome of one engine execution, before it becomes a [`SimResult`]
#[derive(Debug, Clone, Default)]
pub struct Execution {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub runtime: Duration,
    /// Output files, relative to the run directory
    pub output_files: Vec<PathBuf>,
    /// Set when the run failed for a reason other than its exit code
    pub failure: Option<FailureReason>,
}

/// Immutable outcome of one simulation job
///
/// Produced exactly once per execution (or reconstructed from a cache entry)
/// and never modified afterwards. The run directory belongs to the caller;
/// nothing in simbatch deletes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimResult {
    label: String,
    run_dir: PathBuf,
    success: bool,
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
    #[serde(with = "super::secs")]
    runtime: Duration,
    output_files: Vec<PathBuf>,
    failure: Option<FailureReason>,
    cache_key: Option<CacheKey>,
    from_cache: bool,
    finished_at: DateTime<Utc>,
}

impl SimResult {
    /// Builds the result of a finished execution
    ///
    /// A missing explicit failure is derived from the exit code: zero is
    /// success, anything else a [`FailureReason::NonZeroExit`].
    pub fn from_execution(
        label: impl Into<String>,
        run_dir: impl Into<PathBuf>,
        execution: Execution,
        cache_key: Option<CacheKey>,
    ) -> Self {
        let failure = execution.failure.or(match execution.exit_code {
            Some(0) => None,
            Some(code) => Some(FailureReason::NonZeroExit { code }),
            None => Some(FailureReason::Terminated),
        });

        Self {
            label: label.into(),
            run_dir: run_dir.into(),
            success: failure.is_none(),
            exit_code: execution.exit_code,
            stdout: execution.stdout,
            stderr: execution.stderr,
            runtime: execution.runtime,
            output_files: execution.output_files,
            failure,
            cache_key,
            from_cache: false,
            finished_at: Utc::now(),
        }
    }

    /// Builds a failed result for a job that never produced an execution
    pub fn failed(
        label: impl Into<String>,
        run_dir: impl Into<PathBuf>,
        reason: FailureReason,
        runtime: Duration,
    ) -> Self {
        let stderr = reason.to_string();
        Self {
            label: label.into(),
            run_dir: run_dir.into(),
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr,
            runtime,
            output_files: Vec::new(),
            failure: Some(reason),
            cache_key: None,
            from_cache: false,
            finished_at: Utc::now(),
        }
    }

    /// A copy of this result owned by another job and run directory
    ///
    /// Used when a cache hit or a concurrent identical run is handed to a
    /// requester that did not execute the engine itself.
    pub fn relocated(
        &self,
        label: impl Into<String>,
        run_dir: impl Into<PathBuf>,
        from_cache: bool,
    ) -> Self {
        Self {
            label: label.into(),
            run_dir: run_dir.into(),
            from_cache,
            ..self.clone()
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Directory holding this result's files
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// Wall-clock time of the original execution
    pub fn runtime(&self) -> Duration {
        self.runtime
    }

    /// Output files relative to [`SimResult::run_dir`]
    pub fn output_files(&self) -> &[PathBuf] {
        &self.output_files
    }

    /// Absolute path of an output file
    pub fn output_path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.run_dir.join(relative)
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.failure, Some(FailureReason::Timeout { .. }))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.failure, Some(FailureReason::Cancelled))
    }

    pub fn cache_key(&self) -> Option<&CacheKey> {
        self.cache_key.as_ref()
    }

    /// True when the result was served without running the engine
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }
}

/// Results of a batch, aligned with the submitted job order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    results: Vec<SimResult>,
    #[serde(with = "super::secs")]
    runtime: Duration,
}

impl BatchResult {
    pub fn new(results: Vec<SimResult>, runtime: Duration) -> Self {
        Self { results, runtime }
    }

    /// One result per submitted job, in submission order
    pub fn results(&self) -> &[SimResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<SimResult> {
        self.results
    }

    pub fn get(&self, index: usize) -> Option<&SimResult> {
        self.results.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SimResult> {
        self.results.iter()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Total wall-clock time of the batch
    pub fn runtime(&self) -> Duration {
        self.runtime
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(SimResult::success)
    }
}

impl<'a> IntoIterator for &'a BatchResult {
    type Item = &'a SimResult;
    type IntoIter = std::slice::Iter<'a, SimResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.iter()
    }
}
