//! Object store backends
//!
//! Addresses keys as `<prefix>/<path components>` in any
//! [`object_store::ObjectStore`] (S3, GCS, Azure, in-memory, ...).
//!
//! Object stores have no directories:
//! - `make_dirs` is a no-op
//! - `exists` on a "directory" is true when any key lives beneath it
//! - `glob` reports intermediate prefixes as entries, like a directory listing
//! - `remove` deletes the key and every key beneath it

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::{AsyncStorage, MATCH_OPTIONS, Storage, compile_pattern};

/// Async object store storage rooted at a key prefix
#[derive(Debug, Clone)]
pub struct ObjectStorage {
    store: Arc<dyn ObjectStore>,
    prefix: ObjectPath,
}

impl ObjectStorage {
    /// Creates a storage rooted at `prefix` (e.g. `"simulations/cache"`)
    pub fn new(store: Arc<dyn ObjectStore>, prefix: &str) -> Result<Self> {
        let prefix = ObjectPath::parse(prefix.trim_matches('/'))
            .map_err(|e| StorageError::InvalidPath(format!("{}: {}", prefix, e)))?;
        Ok(Self { store, prefix })
    }

    /// The key prefix all paths are resolved under
    pub fn prefix(&self) -> &ObjectPath {
        &self.prefix
    }

    /// Maps a filesystem-style path onto an object key
    fn key_for(&self, path: &Path) -> Result<ObjectPath> {
        let mut key = self.prefix.clone();
        for component in path.components() {
            match component {
                Component::Normal(part) => {
                    let part = part.to_str().ok_or_else(|| {
                        StorageError::InvalidPath(format!("non UTF-8 path: {}", path.display()))
                    })?;
                    key = key.child(part);
                }
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
                Component::ParentDir => {
                    return Err(StorageError::InvalidPath(format!(
                        "parent components are not allowed: {}",
                        path.display()
                    )));
                }
            }
        }
        Ok(key)
    }

    async fn delete_key(&self, key: &ObjectPath, path: &Path) -> Result<()> {
        match self.store.delete(key).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(map_error(key, path, e)),
        }
    }

    async fn list_keys(&self, base: &ObjectPath, path: &Path) -> Result<Vec<ObjectPath>> {
        let mut stream = self.store.list(Some(base));
        let mut keys = Vec::new();
        while let Some(item) = stream.next().await {
            let meta = item.map_err(|e| map_error(base, path, e))?;
            keys.push(meta.location);
        }
        Ok(keys)
    }
}

fn map_error(key: &ObjectPath, path: &Path, err: object_store::Error) -> StorageError {
    match err {
        object_store::Error::NotFound { .. } => StorageError::NotFound(path.to_path_buf()),
        other => StorageError::Backend {
            path: key.to_string(),
            message: other.to_string(),
        },
    }
}

/// Key parts of `location` below `base`, or `None` when it is not beneath it
fn relative_parts(base: &ObjectPath, location: &ObjectPath) -> Option<Vec<String>> {
    let parts: Vec<String> = location
        .prefix_match(base)?
        .map(|part| part.as_ref().to_string())
        .collect();
    if parts.is_empty() { None } else { Some(parts) }
}

#[async_trait]
impl AsyncStorage for ObjectStorage {
    async fn read_bytes(&self, path: &Path) -> Result<Vec<u8>> {
        let key = self.key_for(path)?;
        let result = self
            .store
            .get(&key)
            .await
            .map_err(|e| map_error(&key, path, e))?;
        let bytes = result.bytes().await.map_err(|e| map_error(&key, path, e))?;
        Ok(bytes.to_vec())
    }

    async fn write_bytes(&self, path: &Path, data: &[u8]) -> Result<()> {
        let key = self.key_for(path)?;
        self.store
            .put(&key, Bytes::copy_from_slice(data).into())
            .await
            .map_err(|e| map_error(&key, path, e))?;
        Ok(())
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let key = self.key_for(path)?;
        match self.store.head(&key).await {
            Ok(_) => return Ok(true),
            Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => return Err(map_error(&key, path, e)),
        }

        let mut stream = self.store.list(Some(&key));
        match stream.next().await {
            Some(Ok(_)) => Ok(true),
            Some(Err(e)) => Err(map_error(&key, path, e)),
            None => Ok(false),
        }
    }

    async fn make_dirs(&self, path: &Path) -> Result<()> {
        self.key_for(path)?;
        Ok(())
    }

    async fn copy(&self, src: &Path, dst: &Path) -> Result<()> {
        let from = self.key_for(src)?;
        let to = self.key_for(dst)?;
        self.store
            .copy(&from, &to)
            .await
            .map_err(|e| map_error(&from, src, e))
    }

    async fn glob(&self, path: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
        let matcher = compile_pattern(pattern)?;
        let base = self.key_for(path)?;

        let mut candidates = BTreeSet::new();
        for location in self.list_keys(&base, path).await? {
            let Some(parts) = relative_parts(&base, &location) else {
                continue;
            };
            for depth in 1..=parts.len() {
                candidates.insert(parts[..depth].join("/"));
            }
        }

        Ok(candidates
            .into_iter()
            .filter(|rel| matcher.matches_with(rel, MATCH_OPTIONS))
            .map(|rel| path.join(rel))
            .collect())
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let key = self.key_for(path)?;
        if !key.as_ref().is_empty() {
            self.delete_key(&key, path).await?;
        }

        let nested = self.list_keys(&key, path).await?;
        debug!("Removing {} object(s) under {}", nested.len(), key);
        for location in nested {
            self.delete_key(&location, path).await?;
        }
        Ok(())
    }
}

/// Blocking wrapper around [`ObjectStorage`]
///
/// Each call is driven to completion on the current tokio runtime from a
/// scoped helper thread, or on a throwaway current-thread runtime when no
/// runtime is active. Inside a current-thread runtime the helper thread could
/// never make progress on the store's IO, so calls fail with
/// [`StorageError::Runtime`] there; use [`ObjectStorage`] directly instead.
#[derive(Debug, Clone)]
pub struct BlockingObjectStorage {
    inner: ObjectStorage,
}

impl BlockingObjectStorage {
    pub fn new(inner: ObjectStorage) -> Self {
        Self { inner }
    }

    /// The wrapped async storage
    pub fn inner(&self) -> &ObjectStorage {
        &self.inner
    }
}

fn block_on<F, T>(future: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send,
    T: Send,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::CurrentThread {
            return Err(StorageError::Runtime(
                "blocking object storage needs a multi-thread runtime".into(),
            ));
        }
        std::thread::scope(|s| {
            s.spawn(|| handle.block_on(future))
                .join()
                .map_err(|_| StorageError::Runtime("Thread panicked".into()))?
        })
    } else {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| StorageError::Runtime(format!("Failed to create runtime: {e}")))?;

        rt.block_on(future)
    }
}

impl Storage for BlockingObjectStorage {
    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>> {
        block_on(self.inner.read_bytes(path))
    }

    fn write_bytes(&self, path: &Path, data: &[u8]) -> Result<()> {
        block_on(self.inner.write_bytes(path, data))
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        block_on(self.inner.exists(path))
    }

    fn make_dirs(&self, path: &Path) -> Result<()> {
        block_on(self.inner.make_dirs(path))
    }

    fn copy(&self, src: &Path, dst: &Path) -> Result<()> {
        block_on(AsyncStorage::copy(&self.inner, src, dst))
    }

    fn glob(&self, path: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
        block_on(self.inner.glob(path, pattern))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        block_on(self.inner.remove(path))
    }
}
