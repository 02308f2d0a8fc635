//! Error types for storage backends

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur when using a storage backend
#[derive(Debug, Error)]
pub enum StorageError {
    /// Path does not exist on the backend
    #[error("Not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Local filesystem operation failed
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// Path the operation was applied to
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Object store operation failed (auth, network, permission, ...)
    #[error("Object store error on {path}: {message}")]
    Backend {
        /// Object key the operation was applied to
        path: String,
        /// Error message from the store
        message: String,
    },

    /// Path cannot be expressed on this backend
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Glob pattern failed to parse
    #[error("Invalid glob pattern '{pattern}': {message}")]
    Pattern {
        /// The rejected pattern
        pattern: String,
        /// Parser message
        message: String,
    },

    /// File content was not valid UTF-8
    #[error("File is not valid UTF-8: {}", .0.display())]
    InvalidUtf8(PathBuf),

    /// Blocking bridge onto the async runtime failed
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl StorageError {
    /// Create an I/O error, mapping `ErrorKind::NotFound` onto [`StorageError::NotFound`]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(path)
        } else {
            Self::Io { path, source }
        }
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
