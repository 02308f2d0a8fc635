//! Local filesystem backends

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::{Result, StorageError};
use crate::{AsyncStorage, MATCH_OPTIONS, Storage, compile_pattern};

/// Blocking local filesystem storage
///
/// Paths are used as given. A `glob` below a missing directory returns an
/// empty list, the same as an object-store prefix with no keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalStorage;

impl LocalStorage {
    pub fn new() -> Self {
        Self
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))
        }
        _ => Ok(()),
    }
}

impl Storage for LocalStorage {
    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>> {
        std::fs::read(path).map_err(|e| StorageError::io(path, e))
    }

    fn write_bytes(&self, path: &Path, data: &[u8]) -> Result<()> {
        ensure_parent(path)?;
        std::fs::write(path, data).map_err(|e| StorageError::io(path, e))
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        path.try_exists().map_err(|e| StorageError::io(path, e))
    }

    fn make_dirs(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path).map_err(|e| StorageError::io(path, e))
    }

    fn copy(&self, src: &Path, dst: &Path) -> Result<()> {
        ensure_parent(dst)?;
        std::fs::copy(src, dst)
            .map(|_| ())
            .map_err(|e| StorageError::io(src, e))
    }

    fn glob(&self, path: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
        compile_pattern(pattern)?;
        let base = glob::Pattern::escape(&path.to_string_lossy());
        let full = format!("{}/{}", base.trim_end_matches('/'), pattern);

        let entries = glob::glob_with(&full, MATCH_OPTIONS).map_err(|e| StorageError::Pattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;

        let mut matches = Vec::new();
        for entry in entries {
            match entry {
                Ok(found) => matches.push(found),
                Err(e) => {
                    let failed = e.path().to_path_buf();
                    return Err(StorageError::io(failed, e.into_error()));
                }
            }
        }
        matches.sort();
        Ok(matches)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let metadata = match std::fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StorageError::io(path, e)),
        };

        let removed = if metadata.is_dir() {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_file(path)
        };

        match removed {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(StorageError::io(path, e)),
            _ => Ok(()),
        }
    }
}

/// Async local filesystem storage backed by `tokio::fs`
#[derive(Debug, Clone, Copy, Default)]
pub struct AsyncLocalStorage;

impl AsyncLocalStorage {
    pub fn new() -> Self {
        Self
    }
}

async fn ensure_parent_async(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::io(parent, e)),
        _ => Ok(()),
    }
}

#[async_trait]
impl AsyncStorage for AsyncLocalStorage {
    async fn read_bytes(&self, path: &Path) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .map_err(|e| StorageError::io(path, e))
    }

    async fn write_bytes(&self, path: &Path, data: &[u8]) -> Result<()> {
        ensure_parent_async(path).await?;
        tokio::fs::write(path, data)
            .await
            .map_err(|e| StorageError::io(path, e))
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        tokio::fs::try_exists(path)
            .await
            .map_err(|e| StorageError::io(path, e))
    }

    async fn make_dirs(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| StorageError::io(path, e))
    }

    async fn copy(&self, src: &Path, dst: &Path) -> Result<()> {
        ensure_parent_async(dst).await?;
        tokio::fs::copy(src, dst)
            .await
            .map(|_| ())
            .map_err(|e| StorageError::io(src, e))
    }

    async fn glob(&self, path: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
        let path = path.to_path_buf();
        let pattern = pattern.to_string();
        tokio::task::spawn_blocking(move || LocalStorage.glob(&path, &pattern))
            .await
            .map_err(|e| StorageError::Runtime(format!("spawn_blocking join error: {}", e)))?
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let metadata = match tokio::fs::symlink_metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StorageError::io(path, e)),
        };

        let removed = if metadata.is_dir() {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_file(path).await
        };

        match removed {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(StorageError::io(path, e)),
            _ => Ok(()),
        }
    }
}
