//! Job domain types

use serde::{Deserialize, Serialize};
use simbatch_storage::StorageBackend;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while building a [`Job`]
///
/// These are fatal for the job: it is rejected before anything runs and is
/// never cached.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("model path is empty")]
    MissingModel,

    #[error("annual simulation requires a weather file")]
    MissingWeather,

    #[error("invalid label '{0}': labels must be non-empty and contain no path separators")]
    InvalidLabel(String),

    #[error("annual and design-day modes are mutually exclusive")]
    ConflictingModes,

    #[error("timeout must be greater than zero")]
    InvalidTimeout,

    #[error("invalid option: {0}")]
    InvalidOption(String),
}

/// Output file naming style passed to the engine (`-s`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSuffix {
    /// Legacy: `eplusout.csv`, `eplustbl.htm`
    #[default]
    L,
    /// Capital: `eplusout.csv`, `eplusTable.htm`
    C,
    /// Dash: `eplus-table.htm`
    D,
}

impl OutputSuffix {
    pub fn as_flag(&self) -> &'static str {
        match self {
            OutputSuffix::L => "L",
            OutputSuffix::C => "C",
            OutputSuffix::D => "D",
        }
    }
}

/// Options controlling a single engine run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Run the full weather-file period (`-a`)
    pub annual: bool,

    /// Run design days only (`-D`)
    pub design_day: bool,

    /// Generate auxiliary variable files after the run (`-r`)
    pub readvars: bool,

    /// Output file prefix (`-p`)
    pub output_prefix: String,

    /// Output file naming style (`-s`)
    pub output_suffix: OutputSuffix,

    /// Wall-clock limit; falls back to the runner's configured job timeout
    #[serde(with = "super::secs::option")]
    pub timeout: Option<Duration>,

    /// Passed to the engine verbatim, before the input file
    pub extra_args: Vec<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            annual: false,
            design_day: false,
            readvars: false,
            output_prefix: "eplus".to_string(),
            output_suffix: OutputSuffix::L,
            timeout: None,
            extra_args: Vec::new(),
        }
    }
}

/// One unit of simulation work
///
/// Built through [`Job::builder`] (or deserialized from a [`JobSpec`], which
/// runs the same validation) and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "JobSpec", into = "JobSpec")]
pub struct Job {
    model: PathBuf,
    weather: Option<PathBuf>,
    label: String,
    output_dir: Option<PathBuf>,
    options: RunOptions,
    storage: Option<StorageBackend>,
}

impl Job {
    /// Starts building a job for the given model file
    pub fn builder(model: impl Into<PathBuf>) -> JobBuilder {
        JobBuilder::new(model)
    }

    /// Model (IDF/epJSON) location in the job's storage
    pub fn model(&self) -> &Path {
        &self.model
    }

    /// Weather (EPW) location in the job's storage
    pub fn weather(&self) -> Option<&Path> {
        self.weather.as_deref()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Where outputs are published after the run, if anywhere
    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Storage override for this job's inputs and outputs
    pub fn storage(&self) -> Option<&StorageBackend> {
        self.storage.as_ref()
    }

    /// File name the model is staged under in the run directory
    pub fn staged_model_name(&self) -> String {
        match self.model.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("epjson") => "in.epJSON".to_string(),
            _ => "in.idf".to_string(),
        }
    }
}

/// Builder for [`Job`]
#[derive(Debug, Clone)]
pub struct JobBuilder {
    model: PathBuf,
    weather: Option<PathBuf>,
    label: Option<String>,
    output_dir: Option<PathBuf>,
    options: RunOptions,
    storage: Option<StorageBackend>,
}

impl JobBuilder {
    pub fn new(model: impl Into<PathBuf>) -> Self {
        Self {
            model: model.into(),
            weather: None,
            label: None,
            output_dir: None,
            options: RunOptions::default(),
            storage: None,
        }
    }

    pub fn weather(mut self, weather: impl Into<PathBuf>) -> Self {
        self.weather = Some(weather.into());
        self
    }

    /// Human readable label; defaults to the model's file stem
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(output_dir.into());
        self
    }

    /// Replaces all run options at once
    pub fn options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn annual(mut self, annual: bool) -> Self {
        self.options.annual = annual;
        self
    }

    pub fn design_day(mut self, design_day: bool) -> Self {
        self.options.design_day = design_day;
        self
    }

    pub fn readvars(mut self, readvars: bool) -> Self {
        self.options.readvars = readvars;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.options.extra_args.push(arg.into());
        self
    }

    pub fn storage(mut self, storage: StorageBackend) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Validates and freezes the job
    pub fn build(self) -> Result<Job, ConfigurationError> {
        if self.model.as_os_str().is_empty() {
            return Err(ConfigurationError::MissingModel);
        }

        let label = match self.label {
            Some(label) => label,
            None => self
                .model
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        validate_label(&label)?;
        validate_options(&self.options)?;

        if self.options.annual && self.weather.is_none() {
            return Err(ConfigurationError::MissingWeather);
        }

        Ok(Job {
            model: self.model,
            weather: self.weather,
            label,
            output_dir: self.output_dir,
            options: self.options,
            storage: self.storage,
        })
    }
}

fn validate_label(label: &str) -> Result<(), ConfigurationError> {
    let trimmed = label.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || label.contains(['/', '\\'])
    {
        return Err(ConfigurationError::InvalidLabel(label.to_string()));
    }
    Ok(())
}

fn validate_options(options: &RunOptions) -> Result<(), ConfigurationError> {
    if options.annual && options.design_day {
        return Err(ConfigurationError::ConflictingModes);
    }

    if options.timeout.is_some_and(|timeout| timeout.is_zero()) {
        return Err(ConfigurationError::InvalidTimeout);
    }

    if options.output_prefix.is_empty() || options.output_prefix.contains(['/', '\\']) {
        return Err(ConfigurationError::InvalidOption(format!(
            "output_prefix '{}' must be a plain file name prefix",
            options.output_prefix
        )));
    }

    if options.extra_args.iter().any(|arg| arg.is_empty()) {
        return Err(ConfigurationError::InvalidOption(
            "extra_args must not contain empty arguments".to_string(),
        ));
    }

    Ok(())
}

/// Serializable description of a job, as found in batch manifests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub model: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weather: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub options: RunOptions,
}

impl TryFrom<JobSpec> for Job {
    type Error = ConfigurationError;

    fn try_from(spec: JobSpec) -> Result<Self, Self::Error> {
        let mut builder = Job::builder(spec.model).options(spec.options);
        if let Some(weather) = spec.weather {
            builder = builder.weather(weather);
        }
        if let Some(label) = spec.label {
            builder = builder.label(label);
        }
        if let Some(output_dir) = spec.output_dir {
            builder = builder.output_dir(output_dir);
        }
        builder.build()
    }
}

impl From<Job> for JobSpec {
    fn from(job: Job) -> Self {
        Self {
            model: job.model,
            weather: job.weather,
            label: Some(job.label),
            output_dir: job.output_dir,
            options: job.options,
        }
    }
}
