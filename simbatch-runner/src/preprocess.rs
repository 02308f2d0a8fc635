//! Preprocessing steps run in the staged run directory before the engine
//!
//! Steps run in registration order and may rewrite the staged model (for
//! example expanding HVAC templates). Their names salt the cache key, so
//! adding or removing a step invalidates earlier entries.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::executor::{ExecutorError, Termination, supervise};

/// Why a preprocessing step failed
#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("failed to launch {}: {source}", program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("exited with {}: {stderr}", code.map_or_else(|| "signal".to_string(), |c| format!("code {}", c)))]
    Failed { code: Option<i32>, stderr: String },

    #[error("expected output {} was not produced", .0.display())]
    MissingOutput(PathBuf),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Process(#[from] ExecutorError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// What a step gets to work with
#[derive(Debug, Clone, Copy)]
pub struct PreprocessContext<'a> {
    pub run_dir: &'a Path,
    /// Staged model file name inside `run_dir`
    pub model_name: &'a str,
    /// Shared job deadline, when the timeout covers preprocessing
    pub deadline: Option<(Instant, Duration)>,
    pub cancel: &'a CancellationToken,
    pub poll_interval: Duration,
}

/// A transformation applied to a staged run directory
pub trait Preprocessor: Send + Sync + fmt::Debug {
    /// Stable identifier, part of the cache key salt
    fn name(&self) -> &str;

    fn run(&self, ctx: &PreprocessContext<'_>) -> Result<(), PreprocessError>;
}

/// Runs an external program inside the run directory
///
/// When `replaces_model` is set the program is expected to write that file,
/// which then replaces the staged model.
#[derive(Debug, Clone)]
pub struct CommandPreprocessor {
    name: String,
    program: PathBuf,
    args: Vec<String>,
    replaces_model: Option<String>,
}

impl CommandPreprocessor {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            replaces_model: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn replaces_model_with(mut self, produced: impl Into<String>) -> Self {
        self.replaces_model = Some(produced.into());
        self
    }

    /// The engine's template expander, found next to the executable
    pub fn expand_objects(install_dir: &Path) -> Self {
        let program = if cfg!(windows) {
            "ExpandObjects.exe"
        } else {
            "ExpandObjects"
        };
        Self::new("expand-objects", install_dir.join(program)).replaces_model_with("expanded.idf")
    }

    fn log_path(&self, run_dir: &Path) -> PathBuf {
        run_dir.join(format!("{}.log", self.name))
    }
}

impl Preprocessor for CommandPreprocessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &PreprocessContext<'_>) -> Result<(), PreprocessError> {
        if ctx.cancel.is_cancelled() {
            return Err(PreprocessError::Cancelled);
        }

        let log_path = self.log_path(ctx.run_dir);
        let log = File::create(&log_path).map_err(|source| PreprocessError::Io {
            context: format!("failed to create {}", log_path.display()),
            source,
        })?;
        let log_err = log.try_clone().map_err(|source| PreprocessError::Io {
            context: "failed to duplicate log handle".to_string(),
            source,
        })?;

        info!("Running preprocessor {} in {}", self.name, ctx.run_dir.display());
        let child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(ctx.run_dir)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .spawn()
            .map_err(|source| PreprocessError::Launch {
                program: self.program.clone(),
                source,
            })?;

        let (status, termination) =
            supervise(child, ctx.deadline, ctx.cancel, ctx.poll_interval)?;

        match termination {
            Termination::TimedOut(limit) => return Err(PreprocessError::TimedOut(limit)),
            Termination::Cancelled => return Err(PreprocessError::Cancelled),
            Termination::Exited => {}
        }

        let code = status.and_then(|s| s.code());
        if code != Some(0) {
            let stderr = std::fs::read(&log_path)
                .map(|b| String::from_utf8_lossy(&b).trim().to_string())
                .unwrap_or_default();
            return Err(PreprocessError::Failed { code, stderr });
        }

        if let Some(produced) = &self.replaces_model {
            let produced = ctx.run_dir.join(produced);
            if !produced.is_file() {
                return Err(PreprocessError::MissingOutput(produced));
            }
            let model = ctx.run_dir.join(ctx.model_name);
            std::fs::rename(&produced, &model).map_err(|source| PreprocessError::Io {
                context: format!("failed to replace {}", model.display()),
                source,
            })?;
            debug!("{} replaced {}", self.name, ctx.model_name);
        }

        Ok(())
    }
}
