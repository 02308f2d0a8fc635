//! Simbatch Runner
//!
//! Executes simulation jobs locally, one at a time or in batches.
//!
//! Architecture:
//! - Configuration: settings from the environment or defaults
//! - Executor: engine process supervision (timeouts, cancellation, logs)
//! - Preprocess: steps applied to a staged run directory
//! - Cache: persistent results plus in-flight deduplication
//! - Runner: the single-job pipeline, blocking and async
//! - Scheduler: thread-pool batches and async event streams
//!
//! Identical jobs (same cache key) execute at most once per cache, no
//! matter how many runners, threads or tasks request them concurrently.

pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod preprocess;
pub mod runner;
pub mod scheduler;

// Re-export entry points
pub use cache::ResultCache;
pub use config::{ConfigError, RunnerConfig, TimeoutScope};
pub use error::{CacheError, RunError};
pub use executor::{
    Engine, Executor, ExecutorError, Invocation, ProcessExecutor, ProcessOutcome, Termination,
    check_engine_available,
};
pub use preprocess::{CommandPreprocessor, PreprocessContext, PreprocessError, Preprocessor};
pub use runner::SimulationRunner;
pub use scheduler::{AsyncBatchRunner, BatchRunner, EventStream, simulate_batch};
