//! On-disk cache entry record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use simbatch_core::{CacheKey, SimResult};
use std::path::{Component, Path, PathBuf};

/// Entry format written by this version
pub(crate) const ENTRY_FORMAT: u32 = 1;

/// Commit marker for an entry: written last, after every file it lists
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CacheEntry {
    pub format: u32,
    pub key: CacheKey,
    pub result: SimResult,
    pub files: Vec<ManifestFile>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ManifestFile {
    /// Relative to the entry's `files/` directory
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

impl ManifestFile {
    pub fn describe(path: &Path, bytes: &[u8]) -> Self {
        Self {
            path: path.to_path_buf(),
            size: bytes.len() as u64,
            sha256: digest(bytes),
        }
    }

    /// True when `bytes` is exactly the recorded content
    pub fn matches(&self, bytes: &[u8]) -> bool {
        bytes.len() as u64 == self.size && digest(bytes) == self.sha256
    }
}

impl CacheEntry {
    pub fn new(key: CacheKey, result: SimResult, files: Vec<ManifestFile>) -> Self {
        Self {
            format: ENTRY_FORMAT,
            key,
            result,
            files,
            created_at: Utc::now(),
        }
    }

    /// Structural checks that need no file access
    pub fn check(&self, expected: &CacheKey) -> Result<(), String> {
        if self.format != ENTRY_FORMAT {
            return Err(format!("unsupported entry format {}", self.format));
        }
        if &self.key != expected {
            return Err(format!("entry recorded for key {}", self.key.short()));
        }
        if !self.result.success() {
            return Err("entry holds a failed result".to_string());
        }
        for file in &self.files {
            if !is_contained(&file.path) {
                return Err(format!("manifest path {} escapes the entry", file.path.display()));
            }
        }
        for output in self.result.output_files() {
            if !self.files.iter().any(|f| &f.path == output) {
                return Err(format!("output {} missing from manifest", output.display()));
            }
        }
        Ok(())
    }
}

pub(crate) fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Relative, with no `..`, root or prefix components
pub(crate) fn is_contained(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use simbatch_core::Execution;

    fn result(files: &[&str]) -> SimResult {
        SimResult::from_execution(
            "a",
            "/runs/a",
            Execution {
                exit_code: Some(0),
                output_files: files.iter().map(PathBuf::from).collect(),
                ..Default::default()
            },
            None,
        )
    }

    #[test]
    fn test_manifest_matches_content() {
        let file = ManifestFile::describe(Path::new("eplusout.csv"), b"a,b\n1,2\n");
        assert!(file.matches(b"a,b\n1,2\n"));
        assert!(!file.matches(b"a,b\n1,3\n"));
    }

    #[test]
    fn test_check_rejects_foreign_key() {
        let key = CacheKey::from_bytes([1; 32]);
        let entry = CacheEntry::new(key, result(&[]), vec![]);
        assert!(entry.check(&key).is_ok());
        assert!(entry.check(&CacheKey::from_bytes([2; 32])).is_err());
    }

    #[test]
    fn test_check_requires_manifest_for_outputs() {
        let key = CacheKey::from_bytes([1; 32]);
        let entry = CacheEntry::new(key, result(&["eplusout.csv"]), vec![]);
        assert!(entry.check(&key).is_err());
    }

    #[test]
    fn test_escaping_paths_rejected() {
        assert!(is_contained(Path::new("eplusout.csv")));
        assert!(is_contained(Path::new("reports/table.htm")));
        assert!(!is_contained(Path::new("../etc/passwd")));
        assert!(!is_contained(Path::new("/etc/passwd")));
        assert!(!is_contained(Path::new("")));
    }
}
