//! Engine process execution
//!
//! Handles the engine side of a job:
//! - Resolving and checking the engine executable
//! - Building the command line for a staged run directory
//! - Running the process with stdout/stderr captured to log files
//! - Enforcing the wall-clock limit and cooperative cancellation

use async_trait::async_trait;
use simbatch_core::Job;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RunError;

/// File receiving the engine's standard output inside the run directory
pub const STDOUT_LOG: &str = "stdout.log";
/// File receiving the engine's standard error inside the run directory
pub const STDERR_LOG: &str = "stderr.log";
/// Staged weather file name
pub const STAGED_WEATHER: &str = "in.epw";

/// Resolved simulation engine
///
/// The version string salts every cache key, so results produced by
/// different engine builds never mix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Engine {
    path: PathBuf,
    version: String,
}

impl Engine {
    pub fn new(path: impl Into<PathBuf>, version: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            version: version.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Directory containing the executable (where auxiliary tools live)
    pub fn install_dir(&self) -> Option<&Path> {
        self.path.parent()
    }

    /// Fails when the executable does not exist
    pub fn validate(&self) -> Result<(), RunError> {
        if self.path.is_file() {
            Ok(())
        } else {
            Err(RunError::EngineNotFound(self.path.clone()))
        }
    }
}

/// Checks that the engine runs and returns its reported version line
pub fn check_engine_available(engine: &Engine) -> Result<String, ExecutorError> {
    let output = Command::new(engine.path())
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .map_err(|source| ExecutorError::Launch {
            program: engine.path().to_path_buf(),
            source,
        })?;

    if !output.status.success() {
        return Err(ExecutorError::Unavailable {
            program: engine.path().to_path_buf(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    info!("Engine is available: {}", version);

    Ok(version)
}

/// Errors that prevent an execution from producing an outcome
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The program could not be started (missing binary, permissions)
    #[error("failed to launch {}: {source}", program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The program started but reported itself unusable
    #[error("{} is not working correctly: {message}", program.display())]
    Unavailable { program: PathBuf, message: String },

    /// Log capture or process supervision failed
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExecutorError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// One engine invocation in a staged run directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub run_dir: PathBuf,
    /// Wall-clock limit for the process; `None` runs unbounded
    pub timeout: Option<Duration>,
}

impl Invocation {
    /// Builds the engine command line for `job` staged in `run_dir`
    ///
    /// Layout: `-w in.epw -d <run_dir> -p <prefix> -s <suffix> [-a] [-D] [-r]
    /// [extra...] <model>`.
    pub fn for_job(engine: &Engine, job: &Job, run_dir: &Path, timeout: Option<Duration>) -> Self {
        let options = job.options();
        let mut args = Vec::new();

        if job.weather().is_some() {
            args.push("-w".to_string());
            args.push(run_dir.join(STAGED_WEATHER).display().to_string());
        }
        args.push("-d".to_string());
        args.push(run_dir.display().to_string());
        args.push("-p".to_string());
        args.push(options.output_prefix.clone());
        args.push("-s".to_string());
        args.push(options.output_suffix.as_flag().to_string());
        if options.annual {
            args.push("-a".to_string());
        }
        if options.design_day {
            args.push("-D".to_string());
        }
        if options.readvars {
            args.push("-r".to_string());
        }
        args.extend(options.extra_args.iter().cloned());
        args.push(run_dir.join(job.staged_model_name()).display().to_string());

        Self {
            program: engine.path().to_path_buf(),
            args,
            run_dir: run_dir.to_path_buf(),
            timeout,
        }
    }
}

/// How a supervised process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    /// Killed after exceeding the given limit
    TimedOut(Duration),
    /// Killed because cancellation was requested
    Cancelled,
}

/// Captured outcome of an engine process
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    /// `None` when the process was killed or ended by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    pub termination: Termination,
}

/// Seam between the runner and the engine process
///
/// Both entry points must honor the invocation's timeout and the
/// cancellation token, terminating the process on either.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs to completion on the calling thread
    fn execute(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, ExecutorError>;

    /// Runs without blocking the async runtime
    async fn execute_async(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, ExecutorError>;
}

/// Executes the engine as a child process
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    poll_interval: Duration,
}

impl ProcessExecutor {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    fn execute(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, ExecutorError> {
        let (stdout, stderr) = open_logs(&invocation.run_dir)?;
        debug!(
            "Launching {} {}",
            invocation.program.display(),
            invocation.args.join(" ")
        );

        let started = Instant::now();
        let child = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.run_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|source| ExecutorError::Launch {
                program: invocation.program.clone(),
                source,
            })?;

        let deadline = invocation.timeout.map(|limit| (started + limit, limit));
        let (status, termination) = supervise(child, deadline, cancel, self.poll_interval)?;

        let (stdout, stderr) = read_logs(&invocation.run_dir);
        Ok(outcome(status, termination, stdout, stderr, started))
    }

    async fn execute_async(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, ExecutorError> {
        let (stdout, stderr) = open_logs(&invocation.run_dir)?;
        debug!(
            "Launching {} {}",
            invocation.program.display(),
            invocation.args.join(" ")
        );

        let started = Instant::now();
        let mut child = tokio::process::Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.run_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutorError::Launch {
                program: invocation.program.clone(),
                source,
            })?;

        enum Waited {
            Exited(std::io::Result<ExitStatus>),
            TimedOut(Duration),
            Cancelled,
        }

        let limit = invocation.timeout;
        let expired = async move {
            match limit {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    limit
                }
                None => std::future::pending().await,
            }
        };

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            limit = expired => Waited::TimedOut(limit),
            _ = cancel.cancelled() => Waited::Cancelled,
        };

        let (status, termination) = match waited {
            Waited::Exited(status) => (
                Some(status.map_err(|e| ExecutorError::io("failed to wait for engine", e))?),
                Termination::Exited,
            ),
            Waited::TimedOut(limit) => {
                warn!("Engine exceeded {:?}, killing {}", limit, invocation.run_dir.display());
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill engine process: {}", e);
                }
                (None, Termination::TimedOut(limit))
            }
            Waited::Cancelled => {
                info!("Cancelling engine in {}", invocation.run_dir.display());
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill engine process: {}", e);
                }
                (None, Termination::Cancelled)
            }
        };

        let stdout = tokio::fs::read(invocation.run_dir.join(STDOUT_LOG))
            .await
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default();
        let stderr = tokio::fs::read(invocation.run_dir.join(STDERR_LOG))
            .await
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default();

        Ok(outcome(status, termination, stdout, stderr, started))
    }
}

/// Waits for `child` on the current thread, killing it when the deadline
/// passes or cancellation is requested
pub(crate) fn supervise(
    mut child: std::process::Child,
    deadline: Option<(Instant, Duration)>,
    cancel: &CancellationToken,
    poll_interval: Duration,
) -> Result<(Option<ExitStatus>, Termination), ExecutorError> {
    loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|e| ExecutorError::io("failed to poll process", e))?
        {
            return Ok((Some(status), Termination::Exited));
        }

        if cancel.is_cancelled() {
            kill(&mut child);
            return Ok((None, Termination::Cancelled));
        }

        if let Some((at, limit)) = deadline
            && Instant::now() >= at
        {
            warn!("Process {} exceeded {:?}, killing", child.id(), limit);
            kill(&mut child);
            return Ok((None, Termination::TimedOut(limit)));
        }

        std::thread::sleep(poll_interval);
    }
}

fn kill(child: &mut std::process::Child) {
    if let Err(e) = child.kill() {
        warn!("Failed to kill process {}: {}", child.id(), e);
    }
    // Reap so no zombie is left behind
    let _ = child.wait();
}

fn open_logs(run_dir: &Path) -> Result<(File, File), ExecutorError> {
    let stdout = File::create(run_dir.join(STDOUT_LOG))
        .map_err(|e| ExecutorError::io(format!("failed to create {}", STDOUT_LOG), e))?;
    let stderr = File::create(run_dir.join(STDERR_LOG))
        .map_err(|e| ExecutorError::io(format!("failed to create {}", STDERR_LOG), e))?;
    Ok((stdout, stderr))
}

fn read_logs(run_dir: &Path) -> (String, String) {
    let read = |name: &str| {
        std::fs::read(run_dir.join(name))
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default()
    };
    (read(STDOUT_LOG), read(STDERR_LOG))
}

fn outcome(
    status: Option<ExitStatus>,
    termination: Termination,
    stdout: String,
    stderr: String,
    started: Instant,
) -> ProcessOutcome {
    // Always log stdout/stderr as debug
    if !stdout.trim().is_empty() {
        debug!("engine stdout: {}", stdout.trim());
    }
    if !stderr.trim().is_empty() {
        debug!("engine stderr: {}", stderr.trim());
    }

    ProcessOutcome {
        exit_code: status.and_then(|s| s.code()),
        stdout,
        stderr,
        elapsed: started.elapsed(),
        termination,
    }
}
