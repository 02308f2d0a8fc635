//! Runs real child processes through the runner using shell scripts in place
//! of the engine. Everything lives in one test so no script is executed while
//! another thread still holds it open for writing.
#![cfg(unix)]

use simbatch_core::{FailureReason, Job};
use simbatch_runner::{
    CommandPreprocessor, Engine, RunnerConfig, SimulationRunner, check_engine_available,
};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const ENGINE: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then
    echo "EnergyPlus, Version 24.1.0"
    exit 0
fi
dir=""
while [ $# -gt 1 ]; do
    case "$1" in
        -d) dir="$2"; shift 2 ;;
        -w|-p|-s) shift 2 ;;
        *) shift ;;
    esac
done
cp "$1" "$dir/eplusout.csv"
if grep -q FAIL "$1"; then
    echo "fatal error in model" >&2
    exit 2
fi
echo "EnergyPlus Completed Successfully"
"#;

const EXPAND_OBJECTS: &str = r#"#!/bin/sh
sed 's/HVACTemplate/Expanded/' in.idf > expanded.idf
"#;

fn script(path: &Path, body: &str) {
    fs::write(path, body).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

#[test]
fn test_engine_processes() {
    let dir = tempfile::tempdir().unwrap();
    let engine_path = dir.path().join("energyplus");
    script(&engine_path, ENGINE);
    script(&dir.path().join("ExpandObjects"), EXPAND_OBJECTS);

    let engine = Engine::new(&engine_path, "24.1.0");
    assert!(check_engine_available(&engine).unwrap().contains("24.1.0"));

    let mut config = RunnerConfig::new(dir.path().join("runs"), Some(dir.path().join("cache")));
    config.poll_interval = Duration::from_millis(10);
    let runner = SimulationRunner::new(engine.clone(), config.clone());
    runner.validate().unwrap();

    let model = dir.path().join("office.idf");
    let weather = dir.path().join("chicago.epw");
    fs::write(&model, "Building,Office;\nHVACTemplate:Zone:IdealLoadsAirSystem;\n").unwrap();
    fs::write(&weather, "LOCATION,Chicago\n").unwrap();
    let job = Job::builder(&model).weather(&weather).build().unwrap();

    // Fresh run: engine output and logs land in the run directory
    let first = runner.run(&job).unwrap();
    assert!(first.success(), "{:?}", first.failure());
    assert!(!first.from_cache());
    assert!(first.stdout().contains("Completed Successfully"));
    assert!(first.run_dir().join("in.epw").is_file());
    let csv = fs::read_to_string(first.output_path("eplusout.csv")).unwrap();
    assert!(csv.contains("HVACTemplate"));

    // Same inputs again: served from the cache
    let second = runner.run(&job).unwrap();
    assert!(second.from_cache());
    assert_ne!(second.run_dir(), first.run_dir());
    assert_eq!(
        fs::read_to_string(second.output_path("eplusout.csv")).unwrap(),
        csv
    );

    // Template expansion replaces the staged model and changes the key
    let expanding = SimulationRunner::new(engine, config).with_preprocessor(Arc::new(
        CommandPreprocessor::expand_objects(dir.path()),
    ));
    assert_ne!(
        expanding.cache_key(&job).unwrap(),
        runner.cache_key(&job).unwrap()
    );
    let expanded = expanding.run(&job).unwrap();
    assert!(expanded.success(), "{:?}", expanded.failure());
    assert!(!expanded.from_cache());
    let csv = fs::read_to_string(expanded.output_path("eplusout.csv")).unwrap();
    assert!(csv.contains("Expanded:Zone"));
    assert!(!csv.contains("HVACTemplate"));

    // Non-zero exit is a failed result with the engine's stderr
    let broken = dir.path().join("broken.idf");
    fs::write(&broken, "FAIL\n").unwrap();
    let failed = runner
        .run(&Job::builder(&broken).weather(&weather).build().unwrap())
        .unwrap();
    assert_eq!(failed.failure(), Some(&FailureReason::NonZeroExit { code: 2 }));
    assert!(failed.stderr().contains("fatal error"));
    assert_eq!(runner.cache().unwrap().keys().unwrap().len(), 2);
}
