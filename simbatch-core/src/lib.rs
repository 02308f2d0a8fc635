//! Simbatch Core
//!
//! Core value types for the simbatch simulation orchestrator.
//!
//! This crate contains:
//! - Domain types: jobs, results, batch aggregates and stream events
//! - Cache keys: content fingerprints of a job's semantically relevant inputs
//!
//! Execution logic lives in `simbatch-runner`, storage in `simbatch-storage`.

pub mod domain;

pub use domain::cache_key::{CacheKey, InvalidCacheKey, compute_key};
pub use domain::event::StreamEvent;
pub use domain::job::{ConfigurationError, Job, JobBuilder, JobSpec, OutputSuffix, RunOptions};
pub use domain::result::{BatchResult, Execution, FailureReason, SimResult};
