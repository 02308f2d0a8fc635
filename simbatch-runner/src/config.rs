//! Runner configuration
//!
//! Defines all configurable parameters for the runner including
//! directories, concurrency bounds, timeouts and cache locking.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid runner configuration: {0}")]
pub struct ConfigError(pub String);

/// What the per-job timeout bounds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeoutScope {
    /// Only the engine invocation; preprocessing runs unbounded
    #[default]
    ExecutableOnly,
    /// Preprocessing and the engine share one deadline
    IncludePreprocessing,
}

impl FromStr for TimeoutScope {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "executable" | "executable-only" => Ok(TimeoutScope::ExecutableOnly),
            "all" | "include-preprocessing" => Ok(TimeoutScope::IncludePreprocessing),
            other => Err(ConfigError(format!(
                "unknown timeout scope '{}' (expected 'executable' or 'all')",
                other
            ))),
        }
    }
}

/// Runner configuration
///
/// All timeouts and bounds are configurable to allow tuning
/// for different machines (laptop vs. many-core workstation).
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Base directory for per-job run directories
    pub work_dir: PathBuf,

    /// Local result cache directory; `None` disables caching
    pub cache_dir: Option<PathBuf>,

    /// Worker threads used by the blocking batch runner
    pub max_workers: usize,

    /// In-flight jobs allowed by the async batch runner
    pub max_concurrent: usize,

    /// Default wall-clock limit for a job (overridden per job)
    pub job_timeout: Duration,

    /// Whether the job timeout also bounds preprocessing
    pub timeout_scope: TimeoutScope,

    /// How long to wait for another process holding a cache key lock
    pub lock_timeout: Duration,

    /// Age after which a cache key lock is considered abandoned
    pub lock_stale_after: Duration,

    /// Buffered events between the streaming runner and its consumer
    pub channel_capacity: usize,

    /// How often blocking waits check process status and cancellation
    pub poll_interval: Duration,
}

impl RunnerConfig {
    /// Creates a new configuration with defaults
    pub fn new(work_dir: PathBuf, cache_dir: Option<PathBuf>) -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);

        Self {
            work_dir,
            cache_dir,
            max_workers: parallelism,
            max_concurrent: parallelism,
            job_timeout: Duration::from_secs(3600), // 1 hour
            timeout_scope: TimeoutScope::ExecutableOnly,
            lock_timeout: Duration::from_secs(3900),
            lock_stale_after: Duration::from_secs(7200),
            channel_capacity: 16,
            poll_interval: Duration::from_millis(50),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - SIMBATCH_WORK_DIR (default: <tmp>/simbatch/runs)
    /// - SIMBATCH_CACHE_DIR (default: $XDG_CACHE_HOME/simbatch or ~/.cache/simbatch)
    /// - SIMBATCH_NO_CACHE (any non-empty value other than 0/false disables the cache)
    /// - SIMBATCH_MAX_WORKERS (default: available parallelism)
    /// - SIMBATCH_MAX_CONCURRENT (default: available parallelism)
    /// - SIMBATCH_JOB_TIMEOUT (seconds, default: 3600)
    /// - SIMBATCH_TIMEOUT_SCOPE (executable | all, default: executable)
    /// - SIMBATCH_LOCK_TIMEOUT (seconds, default: 3900)
    /// - SIMBATCH_CHANNEL_CAPACITY (default: 16)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("SIMBATCH_WORK_DIR") {
            config.work_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("SIMBATCH_CACHE_DIR") {
            config.cache_dir = Some(PathBuf::from(dir));
        }

        let no_cache = std::env::var("SIMBATCH_NO_CACHE")
            .map(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
            .unwrap_or(false);
        if no_cache {
            config.cache_dir = None;
        }

        if let Some(n) = env_parse::<usize>("SIMBATCH_MAX_WORKERS") {
            config.max_workers = n;
        }

        if let Some(n) = env_parse::<usize>("SIMBATCH_MAX_CONCURRENT") {
            config.max_concurrent = n;
        }

        if let Some(secs) = env_parse::<u64>("SIMBATCH_JOB_TIMEOUT") {
            config.job_timeout = Duration::from_secs(secs);
        }

        if let Ok(scope) = std::env::var("SIMBATCH_TIMEOUT_SCOPE") {
            config.timeout_scope = scope.parse()?;
        }

        if let Some(secs) = env_parse::<u64>("SIMBATCH_LOCK_TIMEOUT") {
            config.lock_timeout = Duration::from_secs(secs);
        }

        if let Some(n) = env_parse::<usize>("SIMBATCH_CHANNEL_CAPACITY") {
            config.channel_capacity = n;
        }

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.work_dir.as_os_str().is_empty() {
            return Err(ConfigError("work_dir cannot be empty".to_string()));
        }

        if self
            .cache_dir
            .as_ref()
            .is_some_and(|dir| dir.as_os_str().is_empty())
        {
            return Err(ConfigError("cache_dir cannot be empty".to_string()));
        }

        if self.max_workers == 0 {
            return Err(ConfigError("max_workers must be greater than 0".to_string()));
        }

        if self.max_concurrent == 0 {
            return Err(ConfigError(
                "max_concurrent must be greater than 0".to_string(),
            ));
        }

        if self.job_timeout.is_zero() {
            return Err(ConfigError("job_timeout must be greater than 0".to_string()));
        }

        if self.channel_capacity == 0 {
            return Err(ConfigError(
                "channel_capacity must be greater than 0".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError("poll_interval must be greater than 0".to_string()));
        }

        Ok(())
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::new(
            std::env::temp_dir().join("simbatch").join("runs"),
            Some(default_cache_dir()),
        )
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

fn default_cache_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("XDG_CACHE_HOME").filter(|d| !d.is_empty()) {
        return PathBuf::from(dir).join("simbatch");
    }
    if let Some(home) = std::env::var_os("HOME").filter(|d| !d.is_empty()) {
        return PathBuf::from(home).join(".cache").join("simbatch");
    }
    std::env::temp_dir().join("simbatch").join("cache")
}
