mod common;

use common::{FakeExecutor, Workspace};
use object_store::memory::InMemory;
use simbatch_core::{FailureReason, Job};
use simbatch_runner::{Engine, RunError, SimulationRunner};
use simbatch_storage::StorageBackend;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[test]
fn test_run_produces_outputs() {
    let ws = Workspace::new();
    let fake = FakeExecutor::new();
    let runner = ws.runner(&fake);

    let result = runner.run(&ws.job("office", "sleep_ms=10")).unwrap();

    assert!(result.success());
    assert!(!result.from_cache());
    assert_eq!(result.label(), "office");
    assert!(result.run_dir().starts_with(ws.path().join("runs")));
    assert_eq!(result.output_files(), &[std::path::PathBuf::from("eplusout.csv")]);
    assert!(result.output_path("eplusout.csv").is_file());
    assert!(result.stdout().contains("Completed Successfully"));
    assert!(result.cache_key().is_some());
}

#[test]
fn test_identical_job_served_from_cache() {
    let ws = Workspace::new();
    let fake = FakeExecutor::new();
    let runner = ws.runner(&fake);
    let model = ws.model("office", "sleep_ms=10");

    let first = runner
        .run(&Job::builder(&model).label("a").build().unwrap())
        .unwrap();
    let second = runner
        .run(&Job::builder(&model).label("b").build().unwrap())
        .unwrap();

    assert_eq!(fake.invocations(), 1);
    assert!(second.from_cache());
    assert_eq!(second.label(), "b");
    assert_ne!(second.run_dir(), first.run_dir());
    assert_eq!(second.cache_key(), first.cache_key());
    assert_eq!(
        std::fs::read_to_string(second.output_path("eplusout.csv")).unwrap(),
        std::fs::read_to_string(first.output_path("eplusout.csv")).unwrap()
    );
}

#[test]
fn test_engine_version_invalidates_cache() {
    let ws = Workspace::new();
    let fake = FakeExecutor::new();
    let job = ws.job("office", "");

    ws.runner(&fake).run(&job).unwrap();
    let upgraded = SimulationRunner::new(
        Engine::new(ws.path().join("energyplus"), "25.1.0"),
        ws.config(true),
    )
    .with_executor(fake.clone());
    let result = upgraded.run(&job).unwrap();

    assert!(!result.from_cache());
    assert_eq!(fake.invocations(), 2);
}

#[test]
fn test_failed_run_not_cached() {
    let ws = Workspace::new();
    let fake = FakeExecutor::new();
    let runner = ws.runner(&fake);
    let job = ws.job("broken", "exit=2");

    let first = runner.run(&job).unwrap();
    assert!(!first.success());
    assert_eq!(first.exit_code(), Some(2));
    assert_eq!(first.failure(), Some(&FailureReason::NonZeroExit { code: 2 }));

    let second = runner.run(&job).unwrap();
    assert!(!second.from_cache());
    assert_eq!(fake.invocations(), 2);
}

#[test]
fn test_timeout_recorded_in_result() {
    let ws = Workspace::new();
    let fake = FakeExecutor::new();
    let runner = ws.runner(&fake);
    let job = Job::builder(ws.model("slow", "sleep_ms=5000"))
        .timeout(Duration::from_millis(100))
        .build()
        .unwrap();

    let result = runner.run(&job).unwrap();

    assert!(result.is_timeout());
    assert_eq!(
        result.failure(),
        Some(&FailureReason::Timeout {
            limit: Duration::from_millis(100)
        })
    );
    assert!(result.runtime() < Duration::from_secs(5));
}

#[test]
fn test_outputs_published_to_output_dir() {
    let ws = Workspace::new();
    let fake = FakeExecutor::new();
    let runner = ws.runner(&fake);
    let out = ws.path().join("published");
    let job = Job::builder(ws.model("office", ""))
        .output_dir(&out)
        .build()
        .unwrap();

    runner.run(&job).unwrap();

    assert!(out.join("eplusout.csv").is_file());
}

#[test]
fn test_missing_model_is_error() {
    let ws = Workspace::new();
    let fake = FakeExecutor::new();
    let runner = ws.runner(&fake);
    let job = Job::builder(ws.path().join("nope.idf")).build().unwrap();

    let err = runner.run(&job).unwrap_err();

    assert!(matches!(err, RunError::Storage(ref e) if e.is_not_found()));
    assert_eq!(fake.invocations(), 0);
}

#[test]
fn test_missing_engine_fails_validation() {
    let ws = Workspace::new();
    let runner = SimulationRunner::new(
        Engine::new(ws.path().join("missing"), "24.1.0"),
        ws.config(false),
    );

    assert!(matches!(runner.validate(), Err(RunError::EngineNotFound(_))));
}

#[test]
fn test_cancelled_before_start() {
    let ws = Workspace::new();
    let fake = FakeExecutor::new();
    let runner = ws.runner(&fake);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = runner
        .run_with_cancel(&ws.job("office", ""), &cancel)
        .unwrap_err();

    assert!(matches!(err, RunError::Cancelled));
    assert_eq!(fake.invocations(), 0);
}

#[test]
fn test_tampered_entry_is_rebuilt() {
    let ws = Workspace::new();
    let fake = FakeExecutor::new();
    let runner = ws.runner(&fake);
    let job = ws.job("office", "");

    runner.run(&job).unwrap();
    let key = runner.cache_key(&job).unwrap();
    let cached_file = ws
        .path()
        .join("cache")
        .join(key.to_hex())
        .join("files")
        .join("eplusout.csv");
    std::fs::write(&cached_file, "tampered").unwrap();

    let rerun = runner.run(&job).unwrap();
    assert!(!rerun.from_cache());
    assert_eq!(fake.invocations(), 2);

    let served = runner.run(&job).unwrap();
    assert!(served.from_cache());
    assert_ne!(
        std::fs::read_to_string(served.output_path("eplusout.csv")).unwrap(),
        "tampered"
    );
}

#[test]
fn test_uncached_runner_always_executes() {
    let ws = Workspace::new();
    let fake = FakeExecutor::new();
    let runner = ws.uncached_runner(&fake);
    let job = ws.job("office", "");

    runner.run(&job).unwrap();
    let second = runner.run(&job).unwrap();

    assert!(!second.from_cache());
    assert_eq!(fake.invocations(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_async_run_shares_cache_with_blocking() {
    let ws = Workspace::new();
    let fake = FakeExecutor::new();
    let runner = Arc::new(ws.runner(&fake));
    let job = ws.job("office", "sleep_ms=20");

    let first = runner
        .run_async(&job, &CancellationToken::new())
        .await
        .unwrap();
    assert!(first.success());

    let blocking = {
        let runner = runner.clone();
        let job = job.clone();
        tokio::task::spawn_blocking(move || runner.run(&job))
            .await
            .unwrap()
            .unwrap()
    };

    assert!(blocking.from_cache());
    assert_eq!(fake.invocations(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_async_cancellation_terminates_engine() {
    let ws = Workspace::new();
    let fake = FakeExecutor::new();
    let runner = ws.runner(&fake);
    let job = ws.job("slow", "sleep_ms=30000");
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let result = runner.run_async(&job, &cancel).await.unwrap();

    assert!(result.is_cancelled());
    assert_eq!(fake.cancelled(), 1);
    assert!(!runner.cache().unwrap().contains(&runner.cache_key(&job).unwrap()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_inputs_read_from_object_store() {
    let ws = Workspace::new();
    let fake = FakeExecutor::new();
    let runner = ws.runner(&fake);
    let storage = StorageBackend::object_store(Arc::new(InMemory::new()), "bucket").unwrap();
    storage
        .suspending()
        .write_text("models/remote.idf".as_ref(), "! remote\n")
        .await
        .unwrap();

    let job = Job::builder("models/remote.idf")
        .output_dir("results/remote")
        .storage(storage.clone())
        .build()
        .unwrap();
    let result = runner
        .run_async(&job, &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.success());
    let published = storage
        .suspending()
        .read_text("results/remote/eplusout.csv".as_ref())
        .await
        .unwrap();
    assert!(published.contains("! remote"));
}
