#![allow(dead_code)]

use async_trait::async_trait;
use simbatch_core::Job;
use simbatch_runner::{
    Engine, Executor, ExecutorError, Invocation, ProcessOutcome, RunnerConfig, SimulationRunner,
    Termination,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Stand-in engine driven by directives in the staged model:
///
/// ```text
/// sleep_ms=300
/// exit=1
/// ```
///
/// Writes the model back out as `eplusout.csv` so runs have an output file.
#[derive(Debug, Default)]
pub struct FakeExecutor {
    invocations: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    cancelled: AtomicUsize,
    completed: AtomicUsize,
}

struct Directives {
    sleep: Duration,
    exit_code: i32,
}

impl FakeExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Runs that reached their natural end
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    fn enter(&self) -> ActiveGuard<'_> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        ActiveGuard(self)
    }

    fn directives(invocation: &Invocation) -> (String, Directives) {
        let model = invocation
            .args
            .last()
            .map(PathBuf::from)
            .and_then(|path| std::fs::read_to_string(path).ok())
            .unwrap_or_default();

        let mut directives = Directives {
            sleep: Duration::ZERO,
            exit_code: 0,
        };
        for line in model.lines() {
            if let Some(ms) = line.strip_prefix("sleep_ms=") {
                directives.sleep = Duration::from_millis(ms.trim().parse().unwrap_or(0));
            }
            if let Some(code) = line.strip_prefix("exit=") {
                directives.exit_code = code.trim().parse().unwrap_or(0);
            }
        }
        (model, directives)
    }

    fn outcome(
        &self,
        invocation: &Invocation,
        model: &str,
        directives: &Directives,
        termination: Termination,
        started: Instant,
    ) -> ProcessOutcome {
        let exit_code = match termination {
            Termination::Exited => {
                self.completed.fetch_add(1, Ordering::SeqCst);
                std::fs::write(invocation.run_dir.join("eplusout.csv"), model).unwrap();
                Some(directives.exit_code)
            }
            Termination::Cancelled => {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                None
            }
            Termination::TimedOut(_) => None,
        };

        ProcessOutcome {
            exit_code,
            stdout: "EnergyPlus Completed Successfully".to_string(),
            stderr: String::new(),
            elapsed: started.elapsed(),
            termination,
        }
    }
}

struct ActiveGuard<'a>(&'a FakeExecutor);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    fn execute(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, ExecutorError> {
        let _active = self.enter();
        let started = Instant::now();
        let (model, directives) = Self::directives(invocation);

        let termination = loop {
            if cancel.is_cancelled() {
                break Termination::Cancelled;
            }
            if let Some(limit) = invocation.timeout
                && started.elapsed() >= limit
                && directives.sleep > limit
            {
                break Termination::TimedOut(limit);
            }
            if started.elapsed() >= directives.sleep {
                break Termination::Exited;
            }
            std::thread::sleep(Duration::from_millis(5));
        };

        Ok(self.outcome(invocation, &model, &directives, termination, started))
    }

    async fn execute_async(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, ExecutorError> {
        let _active = self.enter();
        let started = Instant::now();
        let (model, directives) = Self::directives(invocation);

        let (wait, termination) = match invocation.timeout {
            Some(limit) if directives.sleep > limit => (limit, Termination::TimedOut(limit)),
            _ => (directives.sleep, Termination::Exited),
        };

        let termination = tokio::select! {
            _ = tokio::time::sleep(wait) => termination,
            _ = cancel.cancelled() => Termination::Cancelled,
        };

        Ok(self.outcome(invocation, &model, &directives, termination, started))
    }
}

/// Scratch area with a placeholder engine binary
pub struct Workspace {
    pub dir: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("energyplus"), "#!/bin/sh\n").unwrap();
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn engine(&self) -> Engine {
        Engine::new(self.path().join("energyplus"), "24.1.0")
    }

    pub fn config(&self, cached: bool) -> RunnerConfig {
        let mut config = RunnerConfig::new(
            self.path().join("runs"),
            cached.then(|| self.path().join("cache")),
        );
        config.max_workers = 4;
        config.max_concurrent = 4;
        config.poll_interval = Duration::from_millis(10);
        config.lock_timeout = Duration::from_secs(30);
        config
    }

    pub fn runner(&self, fake: &Arc<FakeExecutor>) -> SimulationRunner {
        SimulationRunner::new(self.engine(), self.config(true)).with_executor(fake.clone())
    }

    pub fn uncached_runner(&self, fake: &Arc<FakeExecutor>) -> SimulationRunner {
        SimulationRunner::new(self.engine(), self.config(false)).with_executor(fake.clone())
    }

    /// Writes a model file with the given directives
    pub fn model(&self, name: &str, directives: &str) -> PathBuf {
        let path = self.path().join("models").join(format!("{}.idf", name));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, format!("! {}\n{}\n", name, directives)).unwrap();
        path
    }

    pub fn job(&self, name: &str, directives: &str) -> Job {
        Job::builder(self.model(name, directives))
            .label(name)
            .build()
            .unwrap()
    }
}
