use simbatch_core::{CacheKey, Job, SimResult};
use simbatch_storage::{LocalStorage, Storage};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Inputs, SimulationRunner, is_output, run_preprocessors};
use crate::cache::ResultCache;
use crate::error::RunError;
use crate::executor::{Invocation, STAGED_WEATHER};
use crate::preprocess::PreprocessContext;

impl SimulationRunner {
    /// Runs `job` on the calling thread
    ///
    /// Engine failures come back as an unsuccessful [`SimResult`]; `Err` is
    /// reserved for problems that prevented a result (unreadable inputs,
    /// engine launch failure, cancellation).
    pub fn run(&self, job: &Job) -> Result<SimResult, RunError> {
        self.run_with_cancel(job, &CancellationToken::new())
    }

    /// Like [`SimulationRunner::run`], terminating the engine when `cancel`
    /// fires
    pub fn run_with_cancel(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<SimResult, RunError> {
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let inputs = Inputs::read(self.storage_for(job).blocking().as_ref(), job)?;
        let key = self.key_for(job, &inputs);
        debug!("Job {} has cache key {}", job.label(), key.short());

        let Some(cache) = self.cache.as_deref() else {
            let result = self.execute(job, &inputs, None, cancel)?;
            self.publish_outputs(job, &result)?;
            return Ok(result);
        };

        if let Some(result) = self.serve_cached(cache, job, &key)? {
            return Ok(result);
        }

        let Some(mut slot) = cache.registry().acquire_blocking(key, cancel) else {
            return Err(RunError::Cancelled);
        };
        if let Some(shared) = slot.completed().cloned() {
            drop(slot);
            return self.adopt(job, &shared);
        }

        let _lock = cache.lock_blocking(&key, cancel);
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        if let Some(result) = self.serve_cached(cache, job, &key)? {
            slot.publish(result.clone());
            return Ok(result);
        }

        let result = self.execute(job, &inputs, Some(key), cancel)?;
        if let Err(e) = cache.put(&key, &result) {
            warn!("Failed to cache result for {}: {}", job.label(), e);
        }
        if !result.is_cancelled() {
            slot.publish(result.clone());
        }

        self.publish_outputs(job, &result)?;
        Ok(result)
    }

    fn execute(
        &self,
        job: &Job,
        inputs: &Inputs,
        key: Option<CacheKey>,
        cancel: &CancellationToken,
    ) -> Result<SimResult, RunError> {
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        let started = Instant::now();
        let run_dir = self.create_run_dir(job)?;
        self.stage_inputs(job, &run_dir, inputs)?;
        info!("Running job {} in {}", job.label(), run_dir.display());

        let model_name = job.staged_model_name();
        let ctx = PreprocessContext {
            run_dir: &run_dir,
            model_name: &model_name,
            deadline: self.preprocess_deadline(job, started),
            cancel,
            poll_interval: self.config.poll_interval,
        };
        if let Err((step, e)) = run_preprocessors(&self.preprocessors, &ctx) {
            return Ok(self.preprocess_failure(job, run_dir, &step, e, started));
        }

        let Some(timeout) = self.engine_timeout(job, started) else {
            return Ok(self.timed_out(job, run_dir, started));
        };
        let invocation = Invocation::for_job(&self.engine, job, &run_dir, Some(timeout));
        let outcome = self.executor.execute(&invocation, cancel)?;

        let outputs = collect_outputs(&run_dir, job)?;
        Ok(self.finish(job, run_dir, outcome, outputs, key, started))
    }

    fn create_run_dir(&self, job: &Job) -> Result<PathBuf, RunError> {
        let run_dir = self.run_dir_for(job);
        std::fs::create_dir_all(&run_dir).map_err(|e| RunError::run_dir(&run_dir, e))?;
        Ok(run_dir)
    }

    fn stage_inputs(&self, job: &Job, run_dir: &Path, inputs: &Inputs) -> Result<(), RunError> {
        let model = run_dir.join(job.staged_model_name());
        std::fs::write(&model, &inputs.model).map_err(|e| RunError::run_dir(run_dir, e))?;
        if let Some(weather) = &inputs.weather {
            std::fs::write(run_dir.join(STAGED_WEATHER), weather)
                .map_err(|e| RunError::run_dir(run_dir, e))?;
        }
        Ok(())
    }

    fn serve_cached(
        &self,
        cache: &ResultCache,
        job: &Job,
        key: &CacheKey,
    ) -> Result<Option<SimResult>, RunError> {
        let Some(entry) = cache.lookup(key) else {
            return Ok(None);
        };

        let run_dir = self.create_run_dir(job)?;
        if let Err(e) = cache.materialize(&entry, &run_dir) {
            warn!("Discarding cache entry {} for {}: {}", key.short(), job.label(), e);
            cache.discard(key);
            if let Err(e) = LocalStorage.remove(&run_dir) {
                debug!("Failed to remove {}: {}", run_dir.display(), e);
            }
            return Ok(None);
        }

        info!("Cache hit for {} ({})", job.label(), key.short());
        let result = entry.result.relocated(job.label(), run_dir, true);
        self.publish_outputs(job, &result)?;
        Ok(Some(result))
    }

    /// Takes over the result of an identical job that ran concurrently
    fn adopt(&self, job: &Job, shared: &SimResult) -> Result<SimResult, RunError> {
        let run_dir = self.create_run_dir(job)?;
        for relative in shared.output_files() {
            LocalStorage.copy(&shared.output_path(relative), &run_dir.join(relative))?;
        }

        debug!("Job {} reused a concurrent identical run", job.label());
        let result = shared.relocated(job.label(), run_dir, true);
        self.publish_outputs(job, &result)?;
        Ok(result)
    }

    /// Copies outputs to the job's output location, if it has one
    fn publish_outputs(&self, job: &Job, result: &SimResult) -> Result<(), RunError> {
        let Some(output_dir) = job.output_dir() else {
            return Ok(());
        };
        if output_dir == result.run_dir() {
            return Ok(());
        }

        let storage = self.storage_for(job).blocking();
        for relative in result.output_files() {
            let bytes = LocalStorage.read_bytes(&result.output_path(relative))?;
            storage.write_bytes(&output_dir.join(relative), &bytes)?;
        }
        debug!(
            "Published {} file(s) for {} to {}",
            result.output_files().len(),
            job.label(),
            output_dir.display()
        );
        Ok(())
    }
}

fn collect_outputs(run_dir: &Path, job: &Job) -> Result<Vec<PathBuf>, RunError> {
    let mut outputs = Vec::new();
    for path in LocalStorage.glob(run_dir, "*")? {
        if !path.is_file() {
            continue;
        }
        if let Ok(relative) = path.strip_prefix(run_dir)
            && is_output(relative, job)
        {
            outputs.push(relative.to_path_buf());
        }
    }
    Ok(outputs)
}
