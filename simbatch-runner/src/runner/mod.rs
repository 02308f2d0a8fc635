//! Single-job runner
//!
//! Runs one job end to end: read inputs through storage, fingerprint them,
//! serve a cache hit or execute the engine in a fresh run directory, then
//! persist and publish the outputs. The blocking and async entry points
//! share everything here and differ only in how they wait.

mod blocking;
mod nonblocking;

use simbatch_core::{CacheKey, Execution, FailureReason, Job, SimResult};
use simbatch_storage::{AsyncStorage, Storage, StorageBackend};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::ResultCache;
use crate::config::{RunnerConfig, TimeoutScope};
use crate::error::RunError;
use crate::executor::{
    Engine, Executor, ProcessExecutor, ProcessOutcome, STAGED_WEATHER, STDERR_LOG, STDOUT_LOG,
    Termination,
};
use crate::preprocess::{PreprocessContext, PreprocessError, Preprocessor};

/// Runs simulation jobs against one engine
///
/// Cheap to share behind an `Arc`; all state that changes during a run
/// lives in the cache and the run directories.
pub struct SimulationRunner {
    engine: Engine,
    config: RunnerConfig,
    executor: Arc<dyn Executor>,
    preprocessors: Vec<Arc<dyn Preprocessor>>,
    cache: Option<Arc<ResultCache>>,
    storage: StorageBackend,
}

impl SimulationRunner {
    /// Creates a runner executing `engine` as a child process
    ///
    /// A local cache is opened at `config.cache_dir` when one is set.
    pub fn new(engine: Engine, config: RunnerConfig) -> Self {
        let cache = config.cache_dir.as_ref().map(|dir| {
            Arc::new(
                ResultCache::local(dir)
                    .with_lock_timeouts(config.lock_timeout, config.lock_stale_after),
            )
        });

        Self {
            executor: Arc::new(ProcessExecutor::new(config.poll_interval)),
            engine,
            preprocessors: Vec::new(),
            cache,
            storage: StorageBackend::local(),
            config,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    /// Shares `cache` (and its in-flight registry) with this runner
    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache = None;
        self
    }

    /// Storage used for jobs that do not carry their own
    pub fn with_storage(mut self, storage: StorageBackend) -> Self {
        self.storage = storage;
        self
    }

    /// Appends a preprocessing step; steps run in the order added
    pub fn with_preprocessor(mut self, step: Arc<dyn Preprocessor>) -> Self {
        self.preprocessors.push(step);
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&Arc<ResultCache>> {
        self.cache.as_ref()
    }

    pub fn storage(&self) -> &StorageBackend {
        &self.storage
    }

    /// Checks the conditions under which no job could run at all
    pub fn validate(&self) -> Result<(), RunError> {
        self.config.validate()?;
        self.engine.validate()?;
        std::fs::create_dir_all(&self.config.work_dir)
            .map_err(|e| RunError::run_dir(&self.config.work_dir, e))?;
        Ok(())
    }

    /// Computes the cache key `job` would be stored under
    pub fn cache_key(&self, job: &Job) -> Result<CacheKey, RunError> {
        let inputs = Inputs::read(self.storage_for(job).blocking().as_ref(), job)?;
        Ok(self.key_for(job, &inputs))
    }

    fn key_for(&self, job: &Job, inputs: &Inputs) -> CacheKey {
        simbatch_core::compute_key(
            job,
            &inputs.model,
            inputs.weather.as_deref(),
            &self.key_salt(),
        )
    }

    fn key_salt(&self) -> String {
        let steps: Vec<&str> = self.preprocessors.iter().map(|p| p.name()).collect();
        format!(
            "engine={};preprocess={}",
            self.engine.version(),
            steps.join(",")
        )
    }

    fn storage_for<'a>(&'a self, job: &'a Job) -> &'a StorageBackend {
        job.storage().unwrap_or(&self.storage)
    }

    fn job_timeout(&self, job: &Job) -> Duration {
        job.options().timeout.unwrap_or(self.config.job_timeout)
    }

    fn run_dir_for(&self, job: &Job) -> PathBuf {
        self.config
            .work_dir
            .join(format!("{}-{}", job.label(), Uuid::new_v4().simple()))
    }

    fn preprocess_deadline(&self, job: &Job, started: Instant) -> Option<(Instant, Duration)> {
        match self.config.timeout_scope {
            TimeoutScope::ExecutableOnly => None,
            TimeoutScope::IncludePreprocessing => {
                let limit = self.job_timeout(job);
                Some((started + limit, limit))
            }
        }
    }

    /// Limit left for the engine, `None` when preprocessing used it all
    fn engine_timeout(&self, job: &Job, started: Instant) -> Option<Duration> {
        let limit = self.job_timeout(job);
        match self.config.timeout_scope {
            TimeoutScope::ExecutableOnly => Some(limit),
            TimeoutScope::IncludePreprocessing => limit
                .checked_sub(started.elapsed())
                .filter(|left| !left.is_zero()),
        }
    }

    fn timed_out(&self, job: &Job, run_dir: PathBuf, started: Instant) -> SimResult {
        let reason = FailureReason::Timeout {
            limit: self.job_timeout(job),
        };
        warn!("Job {} failed: {}", job.label(), reason);
        SimResult::failed(job.label(), run_dir, reason, started.elapsed())
    }

    fn preprocess_failure(
        &self,
        job: &Job,
        run_dir: PathBuf,
        step: &str,
        error: PreprocessError,
        started: Instant,
    ) -> SimResult {
        let reason = match error {
            PreprocessError::TimedOut(_) => FailureReason::Timeout {
                limit: self.job_timeout(job),
            },
            PreprocessError::Cancelled => FailureReason::Cancelled,
            other => FailureReason::Preprocess {
                step: step.to_string(),
                message: other.to_string(),
            },
        };
        warn!("Job {} failed: {}", job.label(), reason);
        SimResult::failed(job.label(), run_dir, reason, started.elapsed())
    }

    fn finish(
        &self,
        job: &Job,
        run_dir: PathBuf,
        outcome: ProcessOutcome,
        output_files: Vec<PathBuf>,
        key: Option<CacheKey>,
        started: Instant,
    ) -> SimResult {
        let failure = match outcome.termination {
            Termination::Exited => None,
            Termination::TimedOut(_) => Some(FailureReason::Timeout {
                limit: self.job_timeout(job),
            }),
            Termination::Cancelled => Some(FailureReason::Cancelled),
        };

        let execution = Execution {
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            runtime: started.elapsed(),
            output_files,
            failure,
        };
        let result = SimResult::from_execution(job.label(), run_dir, execution, key);

        match result.failure() {
            None => info!(
                "Job {} completed in {:.2}s",
                job.label(),
                result.runtime().as_secs_f64()
            ),
            Some(reason) => warn!("Job {} failed: {}", job.label(), reason),
        }
        result
    }
}

/// Input bytes of one job, read once per run
struct Inputs {
    model: Vec<u8>,
    weather: Option<Vec<u8>>,
}

impl Inputs {
    fn read(storage: &dyn Storage, job: &Job) -> Result<Self, RunError> {
        let model = storage.read_bytes(job.model())?;
        let weather = match job.weather() {
            Some(path) => Some(storage.read_bytes(path)?),
            None => None,
        };
        Ok(Self { model, weather })
    }

    async fn read_async(storage: &dyn AsyncStorage, job: &Job) -> Result<Self, RunError> {
        let model = storage.read_bytes(job.model()).await?;
        let weather = match job.weather() {
            Some(path) => Some(storage.read_bytes(path).await?),
            None => None,
        };
        Ok(Self { model, weather })
    }
}

/// Runs each step in order, stopping at the first failure
fn run_preprocessors(
    steps: &[Arc<dyn Preprocessor>],
    ctx: &PreprocessContext<'_>,
) -> Result<(), (String, PreprocessError)> {
    for step in steps {
        step.run(ctx).map_err(|e| (step.name().to_string(), e))?;
    }
    Ok(())
}

/// True for files the engine produced, as opposed to what was staged
fn is_output(relative: &Path, job: &Job) -> bool {
    let staged = job.staged_model_name();
    ![staged.as_str(), STAGED_WEATHER, STDOUT_LOG, STDERR_LOG]
        .iter()
        .any(|name| relative == Path::new(name))
}
