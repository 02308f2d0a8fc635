//! Configuration module
//!
//! Layers command-line flags over the runner's environment configuration.

use anyhow::{Context, Result};
use simbatch_runner::{CommandPreprocessor, Engine, RunnerConfig, SimulationRunner};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the engine executable
    pub engine: PathBuf,

    /// Engine version, part of every cache key
    pub engine_version: String,

    pub work_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub no_cache: bool,

    /// Run the template expander before the engine
    pub expand_objects: bool,
}

impl Config {
    /// Runner configuration: environment first, then flags
    pub fn runner_config(&self) -> Result<RunnerConfig> {
        let mut config = RunnerConfig::from_env().context("Invalid SIMBATCH_* environment")?;

        if let Some(dir) = &self.work_dir {
            config.work_dir = dir.clone();
        }
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = Some(dir.clone());
        }
        if self.no_cache {
            config.cache_dir = None;
        }

        config.validate()?;
        debug!("Runner configuration: {:?}", config);
        Ok(config)
    }

    pub fn engine(&self) -> Engine {
        Engine::new(&self.engine, &self.engine_version)
    }

    /// Builds the runner shared by every command
    pub fn runner(&self) -> Result<SimulationRunner> {
        let engine = self.engine();
        let install_dir = engine.install_dir().map(PathBuf::from);
        let mut runner = SimulationRunner::new(engine, self.runner_config()?);

        if self.expand_objects {
            let dir = install_dir.context("Cannot locate ExpandObjects next to the engine")?;
            runner = runner.with_preprocessor(Arc::new(CommandPreprocessor::expand_objects(&dir)));
        }

        Ok(runner)
    }
}
