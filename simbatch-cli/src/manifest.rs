//! Batch manifest loading
//!
//! A manifest is a JSON document listing job specs:
//!
//! ```json
//! { "jobs": [ { "model": "office.idf", "weather": "chicago.epw", "label": "office" } ] }
//! ```
//!
//! Relative paths are resolved against the manifest's directory.

use anyhow::{Context, Result};
use serde::Deserialize;
use simbatch_core::{Job, JobSpec};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct Manifest {
    jobs: Vec<JobSpec>,
}

/// Reads and validates every job in the manifest at `path`
pub fn load(path: &Path) -> Result<Vec<Job>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    parse(&text, base).with_context(|| format!("Invalid manifest {}", path.display()))
}

fn parse(text: &str, base: &Path) -> Result<Vec<Job>> {
    let manifest: Manifest = serde_json::from_str(text).context("Malformed JSON")?;

    manifest
        .jobs
        .into_iter()
        .enumerate()
        .map(|(index, mut spec)| {
            spec.model = resolve(base, spec.model);
            spec.weather = spec.weather.map(|w| resolve(base, w));
            spec.output_dir = spec.output_dir.map(|d| resolve(base, d));
            Job::try_from(spec).with_context(|| format!("Job #{} is invalid", index + 1))
        })
        .collect()
}

fn resolve(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest() {
        let text = r#"{
            "jobs": [
                { "model": "office.idf", "weather": "/data/chicago.epw" },
                { "model": "box.epJSON", "label": "box-dd", "options": { "design_day": true } }
            ]
        }"#;

        let jobs = parse(text, Path::new("/models")).unwrap();

        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].model(), Path::new("/models/office.idf"));
        assert_eq!(jobs[0].weather(), Some(Path::new("/data/chicago.epw")));
        assert_eq!(jobs[0].label(), "office");
        assert_eq!(jobs[1].label(), "box-dd");
        assert!(jobs[1].options().design_day);
    }

    #[test]
    fn test_invalid_job_reports_position() {
        let text = r#"{ "jobs": [
            { "model": "a.idf" },
            { "model": "b.idf", "options": { "annual": true, "design_day": true } }
        ] }"#;

        let err = parse(text, Path::new(".")).unwrap_err();
        assert!(format!("{:#}", err).contains("Job #2"));
    }
}
