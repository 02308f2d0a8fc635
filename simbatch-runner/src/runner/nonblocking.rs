use simbatch_core::{CacheKey, Job, SimResult};
use simbatch_storage::{AsyncLocalStorage, AsyncStorage};
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
    /// Runs `job` without blocking the async runtime
    ///
    /// Cancelling `cancel` (or dropping the returned future) terminates the
    /// engine process. Waits on identical in-flight jobs also end on
    /// cancellation.
    pub async fn run_async(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<SimResult, RunError> {
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let inputs = Inputs::read_async(self.storage_for(job).suspending().as_ref(), job).await?;
        let key = self.key_for(job, &inputs);
        debug!("Job {} has cache key {}", job.label(), key.short());

        let Some(cache) = self.cache.as_deref() else {
            let result = self.execute_async(job, &inputs, None, cancel).await?;
            self.publish_outputs_async(job, &result).await?;
            return Ok(result);
        };

        if let Some(result) = self.serve_cached_async(cache, job, &key).await? {
            return Ok(result);
        }

        let Some(mut slot) = cache.registry().acquire(key, cancel).await else {
            return Err(RunError::Cancelled);
        };
        if let Some(shared) = slot.completed().cloned() {
            drop(slot);
            return self.adopt_async(job, &shared).await;
        }

        let _lock = cache.lock(&key, cancel).await;
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        if let Some(result) = self.serve_cached_async(cache, job, &key).await? {
            slot.publish(result.clone());
            return Ok(result);
        }

        let result = self.execute_async(job, &inputs, Some(key), cancel).await?;
        if let Err(e) = cache.put_async(&key, &result).await {
            warn!("Failed to cache result for {}: {}", job.label(), e);
        }
        if !result.is_cancelled() {
            slot.publish(result.clone());
        }

        self.publish_outputs_async(job, &result).await?;
        Ok(result)
    }

    async fn execute_async(
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
        let run_dir = self.create_run_dir_async(job).await?;
        self.stage_inputs_async(job, &run_dir, inputs).await?;
        info!("Running job {} in {}", job.label(), run_dir.display());

        if !self.preprocessors.is_empty() {
            let steps = self.preprocessors.clone();
            let dir = run_dir.clone();
            let model_name = job.staged_model_name();
            let deadline = self.preprocess_deadline(job, started);
            let token = cancel.clone();
            let poll_interval = self.config.poll_interval;

            let preprocessed = tokio::task::spawn_blocking(move || {
                let ctx = PreprocessContext {
                    run_dir: &dir,
                    model_name: &model_name,
                    deadline,
                    cancel: &token,
                    poll_interval,
                };
                run_preprocessors(&steps, &ctx)
            })
            .await
            .map_err(|e| RunError::Task(e.to_string()))?;

            if let Err((step, e)) = preprocessed {
                return Ok(self.preprocess_failure(job, run_dir, &step, e, started));
            }
        }

        let Some(timeout) = self.engine_timeout(job, started) else {
            return Ok(self.timed_out(job, run_dir, started));
        };
        let invocation = Invocation::for_job(&self.engine, job, &run_dir, Some(timeout));
        let outcome = self.executor.execute_async(&invocation, cancel).await?;

        let outputs = collect_outputs_async(&run_dir, job).await?;
        Ok(self.finish(job, run_dir, outcome, outputs, key, started))
    }

    async fn create_run_dir_async(&self, job: &Job) -> Result<PathBuf, RunError> {
        let run_dir = self.run_dir_for(job);
        tokio::fs::create_dir_all(&run_dir)
            .await
            .map_err(|e| RunError::run_dir(&run_dir, e))?;
        Ok(run_dir)
    }

    async fn stage_inputs_async(
        &self,
        job: &Job,
        run_dir: &Path,
        inputs: &Inputs,
    ) -> Result<(), RunError> {
        let model = run_dir.join(job.staged_model_name());
        tokio::fs::write(&model, &inputs.model)
            .await
            .map_err(|e| RunError::run_dir(run_dir, e))?;
        if let Some(weather) = &inputs.weather {
            tokio::fs::write(run_dir.join(STAGED_WEATHER), weather)
                .await
                .map_err(|e| RunError::run_dir(run_dir, e))?;
        }
        Ok(())
    }

    async fn serve_cached_async(
        &self,
        cache: &ResultCache,
        job: &Job,
        key: &CacheKey,
    ) -> Result<Option<SimResult>, RunError> {
        let Some(entry) = cache.lookup_async(key).await else {
            return Ok(None);
        };

        let run_dir = self.create_run_dir_async(job).await?;
        if let Err(e) = cache.materialize_async(&entry, &run_dir).await {
            warn!("Discarding cache entry {} for {}: {}", key.short(), job.label(), e);
            cache.discard_async(key).await;
            if let Err(e) = AsyncLocalStorage.remove(&run_dir).await {
                debug!("Failed to remove {}: {}", run_dir.display(), e);
            }
            return Ok(None);
        }

        info!("Cache hit for {} ({})", job.label(), key.short());
        let result = entry.result.relocated(job.label(), run_dir, true);
        self.publish_outputs_async(job, &result).await?;
        Ok(Some(result))
    }

    async fn adopt_async(&self, job: &Job, shared: &SimResult) -> Result<SimResult, RunError> {
        let run_dir = self.create_run_dir_async(job).await?;
        for relative in shared.output_files() {
            AsyncLocalStorage
                .copy(&shared.output_path(relative), &run_dir.join(relative))
                .await?;
        }

        debug!("Job {} reused a concurrent identical run", job.label());
        let result = shared.relocated(job.label(), run_dir, true);
        self.publish_outputs_async(job, &result).await?;
        Ok(result)
    }

    async fn publish_outputs_async(&self, job: &Job, result: &SimResult) -> Result<(), RunError> {
        let Some(output_dir) = job.output_dir() else {
            return Ok(());
        };
        if output_dir == result.run_dir() {
            return Ok(());
        }

        let storage = self.storage_for(job).suspending();
        for relative in result.output_files() {
            let bytes = AsyncLocalStorage
                .read_bytes(&result.output_path(relative))
                .await?;
            storage.write_bytes(&output_dir.join(relative), &bytes).await?;
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

async fn collect_outputs_async(run_dir: &Path, job: &Job) -> Result<Vec<PathBuf>, RunError> {
    let mut outputs = Vec::new();
    for path in AsyncLocalStorage.glob(run_dir, "*").await? {
        let is_file = tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
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
