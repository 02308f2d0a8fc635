//! Simbatch Storage
//!
//! A uniform capability interface over the places simulation inputs and
//! outputs live: the local filesystem or a remote object store.
//!
//! Every backend implements the same nine operations twice:
//! - [`Storage`]: blocking, for worker threads
//! - [`AsyncStorage`]: suspension-capable, for tokio tasks
//!
//! Semantics are identical across backends and flavors:
//! - writes create missing parent directories and are visible to later reads
//! - `glob` never recurses unless the pattern says so (`*` stops at `/`)
//! - `copy` is read-then-write and is not atomic across failure
//! - `remove` on a missing path is a no-op; on a directory it removes the tree
//! - backend failures are errors, never empty results
//!
//! # Example
//!
//! ```no_run
//! use simbatch_storage::{LocalStorage, Storage};
//! use std::path::Path;
//!
//! let storage = LocalStorage::new();
//! storage.write_text(Path::new("/tmp/run/in.idf"), "Version,24.1;")?;
//! let idf = storage.read_text(Path::new("/tmp/run/in.idf"))?;
//! # Ok::<(), simbatch_storage::StorageError>(())
//! ```

pub mod error;
mod local;
mod object;

pub use error::{Result, StorageError};
pub use local::{AsyncLocalStorage, LocalStorage};
pub use object::{BlockingObjectStorage, ObjectStorage};

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Blocking storage capability
pub trait Storage: Send + Sync + fmt::Debug {
    /// Reads the full content of `path`
    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>>;

    /// Writes `data` to `path`, replacing any existing content
    fn write_bytes(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Reads `path` as UTF-8 text
    fn read_text(&self, path: &Path) -> Result<String> {
        let bytes = self.read_bytes(path)?;
        String::from_utf8(bytes).map_err(|_| StorageError::InvalidUtf8(path.to_path_buf()))
    }

    /// Writes UTF-8 text to `path`
    fn write_text(&self, path: &Path, text: &str) -> Result<()> {
        self.write_bytes(path, text.as_bytes())
    }

    /// Returns whether a file or directory exists at `path`
    fn exists(&self, path: &Path) -> Result<bool>;

    /// Creates `path` and all missing parents
    fn make_dirs(&self, path: &Path) -> Result<()>;

    /// Copies `src` to `dst` (read-then-write)
    fn copy(&self, src: &Path, dst: &Path) -> Result<()> {
        let data = self.read_bytes(src)?;
        self.write_bytes(dst, &data)
    }

    /// Lists entries under `path` matching `pattern`, sorted
    fn glob(&self, path: &Path, pattern: &str) -> Result<Vec<PathBuf>>;

    /// Removes a file or directory tree; missing paths are ignored
    fn remove(&self, path: &Path) -> Result<()>;
}

/// Suspension-capable storage capability
///
/// Same contract as [`Storage`], awaited instead of blocking.
#[async_trait]
pub trait AsyncStorage: Send + Sync + fmt::Debug {
    async fn read_bytes(&self, path: &Path) -> Result<Vec<u8>>;

    async fn write_bytes(&self, path: &Path, data: &[u8]) -> Result<()>;

    async fn read_text(&self, path: &Path) -> Result<String> {
        let bytes = self.read_bytes(path).await?;
        String::from_utf8(bytes).map_err(|_| StorageError::InvalidUtf8(path.to_path_buf()))
    }

    async fn write_text(&self, path: &Path, text: &str) -> Result<()> {
        self.write_bytes(path, text.as_bytes()).await
    }

    async fn exists(&self, path: &Path) -> Result<bool>;

    async fn make_dirs(&self, path: &Path) -> Result<()>;

    async fn copy(&self, src: &Path, dst: &Path) -> Result<()> {
        let data = self.read_bytes(src).await?;
        self.write_bytes(dst, &data).await
    }

    async fn glob(&self, path: &Path, pattern: &str) -> Result<Vec<PathBuf>>;

    async fn remove(&self, path: &Path) -> Result<()>;
}

/// A blocking and an async handle over the same backend configuration
///
/// Passed explicitly to every entry point that touches storage; there is no
/// process-wide default backend.
#[derive(Clone)]
pub struct StorageBackend {
    blocking: Arc<dyn Storage>,
    suspending: Arc<dyn AsyncStorage>,
}

impl StorageBackend {
    /// Pair two handles that address the same data
    pub fn new(blocking: Arc<dyn Storage>, suspending: Arc<dyn AsyncStorage>) -> Self {
        Self {
            blocking,
            suspending,
        }
    }

    /// Local filesystem backend
    pub fn local() -> Self {
        Self::new(Arc::new(LocalStorage::new()), Arc::new(AsyncLocalStorage::new()))
    }

    /// Object store backend rooted at `prefix`
    pub fn object_store(store: Arc<dyn object_store::ObjectStore>, prefix: &str) -> Result<Self> {
        let storage = ObjectStorage::new(store, prefix)?;
        Ok(Self::new(
            Arc::new(BlockingObjectStorage::new(storage.clone())),
            Arc::new(storage),
        ))
    }

    /// Blocking handle
    pub fn blocking(&self) -> &Arc<dyn Storage> {
        &self.blocking
    }

    /// Async handle
    pub fn suspending(&self) -> &Arc<dyn AsyncStorage> {
        &self.suspending
    }
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::local()
    }
}

impl fmt::Debug for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageBackend")
            .field("blocking", &self.blocking)
            .field("suspending", &self.suspending)
            .finish()
    }
}

/// Compiles a glob pattern with `*` stopping at path separators
pub(crate) fn compile_pattern(pattern: &str) -> Result<glob::Pattern> {
    glob::Pattern::new(pattern).map_err(|e| StorageError::Pattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

pub(crate) const MATCH_OPTIONS: glob::MatchOptions = glob::MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};
