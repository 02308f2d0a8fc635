//! Persistent result cache
//!
//! Layout under the cache root, one directory per key:
//!
//! ```text
//! <root>/<key-hex>/files/<output files>
//! <root>/<key-hex>/entry.json        commit marker, written last
//! <root>/.locks/<key-hex>.lock       advisory lock (local caches only)
//! ```
//!
//! Only successful results are stored. Entries are write-once; an entry
//! that fails to decode, references missing files or fails verification is
//! treated as a miss and never surfaces as an error to the runner.

mod entry;
mod lock;
mod registry;

pub use registry::{InFlightRegistry, KeyGuard};

pub(crate) use entry::CacheEntry;
pub(crate) use lock::LockFile;

use simbatch_core::{CacheKey, SimResult};
use simbatch_storage::{AsyncLocalStorage, AsyncStorage, LocalStorage, Storage, StorageBackend};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CacheError;
use entry::{ManifestFile, is_contained};
use lock::LockSettings;

const ENTRY_FILE: &str = "entry.json";
const FILES_DIR: &str = "files";
const LOCK_DIR: &str = ".locks";

#[derive(Debug)]
pub struct ResultCache {
    storage: StorageBackend,
    root: PathBuf,
    registry: InFlightRegistry,
    locks: Option<LockSettings>,
}

impl ResultCache {
    /// Cache rooted at `root` inside `storage`
    ///
    /// Duplicate work is prevented within this process only; cross-process
    /// locking needs a local cache (see [`ResultCache::local`]).
    pub fn new(storage: StorageBackend, root: impl Into<PathBuf>) -> Self {
        Self {
            storage,
            root: root.into(),
            registry: InFlightRegistry::new(),
            locks: None,
        }
    }

    /// Cache in a local directory, with cross-process lock files
    pub fn local(dir: impl Into<PathBuf>) -> Self {
        let root = dir.into();
        let locks = LockSettings {
            dir: root.join(LOCK_DIR),
            timeout: Duration::from_secs(3900),
            stale_after: Duration::from_secs(7200),
        };
        Self {
            locks: Some(locks),
            ..Self::new(StorageBackend::local(), root)
        }
    }

    /// Bounds the wait on another process's lock and sets the age after
    /// which a lock is considered abandoned
    pub fn with_lock_timeouts(mut self, timeout: Duration, stale_after: Duration) -> Self {
        if let Some(locks) = self.locks.as_mut() {
            locks.timeout = timeout;
            locks.stale_after = stale_after;
        }
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn storage(&self) -> &StorageBackend {
        &self.storage
    }

    pub(crate) fn registry(&self) -> &InFlightRegistry {
        &self.registry
    }

    fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.to_hex())
    }

    fn entry_file(&self, key: &CacheKey) -> PathBuf {
        self.entry_dir(key).join(ENTRY_FILE)
    }

    fn files_dir(&self, key: &CacheKey) -> PathBuf {
        self.entry_dir(key).join(FILES_DIR)
    }

    /// Stored result for `key`, pointing at the entry's files
    pub fn get(&self, key: &CacheKey) -> Option<SimResult> {
        self.lookup(key).map(|entry| self.served(key, &entry))
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lookup(key).is_some()
    }

    /// Stores a successful result and copies its output files
    ///
    /// Returns `false` without writing when the result failed or a valid
    /// entry already exists for `key`. An unreadable entry is overwritten.
    pub fn put(&self, key: &CacheKey, result: &SimResult) -> Result<bool, CacheError> {
        if !result.success() {
            debug!("Not caching failed result for {}", result.label());
            return Ok(false);
        }

        if matches!(self.load(key), Ok(Some(_))) {
            debug!("Entry {} already present", key.short());
            return Ok(false);
        }

        let storage = self.storage.blocking();
        let entry_file = self.entry_file(key);

        let files_dir = self.files_dir(key);
        let mut files = Vec::with_capacity(result.output_files().len());
        for relative in result.output_files() {
            check_output(key, relative)?;
            let bytes = LocalStorage.read_bytes(&result.output_path(relative))?;
            storage.write_bytes(&files_dir.join(relative), &bytes)?;
            files.push(ManifestFile::describe(relative, &bytes));
        }

        let entry = CacheEntry::new(*key, result.clone(), files);
        storage.write_bytes(&entry_file, &serde_json::to_vec_pretty(&entry)?)?;
        info!("Cached result for {} as {}", result.label(), key.short());
        Ok(true)
    }

    /// Removes every entry; lock files and in-flight work are left alone
    pub fn clear(&self) -> Result<(), CacheError> {
        let storage = self.storage.blocking();
        for path in storage.glob(&self.root, "*")? {
            if !is_lock_dir(&path) {
                storage.remove(&path)?;
            }
        }
        info!("Cleared cache at {}", self.root.display());
        Ok(())
    }

    /// Keys with a committed entry
    pub fn keys(&self) -> Result<Vec<CacheKey>, CacheError> {
        let found = self.storage.blocking().glob(&self.root, "*/entry.json")?;
        Ok(keys_from(&found))
    }

    pub async fn get_async(&self, key: &CacheKey) -> Option<SimResult> {
        self.lookup_async(key)
            .await
            .map(|entry| self.served(key, &entry))
    }

    pub async fn contains_async(&self, key: &CacheKey) -> bool {
        self.lookup_async(key).await.is_some()
    }

    /// Async variant of [`ResultCache::put`]
    pub async fn put_async(&self, key: &CacheKey, result: &SimResult) -> Result<bool, CacheError> {
        if !result.success() {
            debug!("Not caching failed result for {}", result.label());
            return Ok(false);
        }

        if matches!(self.load_async(key).await, Ok(Some(_))) {
            debug!("Entry {} already present", key.short());
            return Ok(false);
        }

        let storage = self.storage.suspending();
        let entry_file = self.entry_file(key);

        let files_dir = self.files_dir(key);
        let mut files = Vec::with_capacity(result.output_files().len());
        for relative in result.output_files() {
            check_output(key, relative)?;
            let bytes = AsyncLocalStorage
                .read_bytes(&result.output_path(relative))
                .await?;
            storage.write_bytes(&files_dir.join(relative), &bytes).await?;
            files.push(ManifestFile::describe(relative, &bytes));
        }

        let entry = CacheEntry::new(*key, result.clone(), files);
        storage
            .write_bytes(&entry_file, &serde_json::to_vec_pretty(&entry)?)
            .await?;
        info!("Cached result for {} as {}", result.label(), key.short());
        Ok(true)
    }

    pub async fn clear_async(&self) -> Result<(), CacheError> {
        let storage = self.storage.suspending();
        for path in storage.glob(&self.root, "*").await? {
            if !is_lock_dir(&path) {
                storage.remove(&path).await?;
            }
        }
        info!("Cleared cache at {}", self.root.display());
        Ok(())
    }

    /// Committed, structurally valid entry for `key`
    pub(crate) fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        match self.load(key) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Ignoring cache entry {}: {}", key.short(), e);
                None
            }
        }
    }

    pub(crate) async fn lookup_async(&self, key: &CacheKey) -> Option<CacheEntry> {
        match self.load_async(key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Ignoring cache entry {}: {}", key.short(), e);
                None
            }
        }
    }

    fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let storage = self.storage.blocking();
        let bytes = match storage.read_bytes(&self.entry_file(key)) {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let entry = decode(key, &bytes)?;
        let files_dir = self.files_dir(key);
        for file in &entry.files {
            if !storage.exists(&files_dir.join(&file.path))? {
                return Err(corrupt(key, format!("{} is missing", file.path.display())));
            }
        }
        Ok(Some(entry))
    }

    async fn load_async(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let storage = self.storage.suspending();
        let bytes = match storage.read_bytes(&self.entry_file(key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let entry = decode(key, &bytes)?;
        let files_dir = self.files_dir(key);
        for file in &entry.files {
            if !storage.exists(&files_dir.join(&file.path)).await? {
                return Err(corrupt(key, format!("{} is missing", file.path.display())));
            }
        }
        Ok(Some(entry))
    }

    /// Copies an entry's files into a local run directory, verifying each
    /// against its recorded digest
    pub(crate) fn materialize(&self, entry: &CacheEntry, run_dir: &Path) -> Result<(), CacheError> {
        let storage = self.storage.blocking();
        let files_dir = self.files_dir(&entry.key);
        for file in &entry.files {
            let bytes = storage.read_bytes(&files_dir.join(&file.path))?;
            if !file.matches(&bytes) {
                return Err(corrupt(
                    &entry.key,
                    format!("{} failed verification", file.path.display()),
                ));
            }
            LocalStorage.write_bytes(&run_dir.join(&file.path), &bytes)?;
        }
        Ok(())
    }

    pub(crate) async fn materialize_async(
        &self,
        entry: &CacheEntry,
        run_dir: &Path,
    ) -> Result<(), CacheError> {
        let storage = self.storage.suspending();
        let files_dir = self.files_dir(&entry.key);
        for file in &entry.files {
            let bytes = storage.read_bytes(&files_dir.join(&file.path)).await?;
            if !file.matches(&bytes) {
                return Err(corrupt(
                    &entry.key,
                    format!("{} failed verification", file.path.display()),
                ));
            }
            AsyncLocalStorage
                .write_bytes(&run_dir.join(&file.path), &bytes)
                .await?;
        }
        Ok(())
    }

    /// Drops the entry for `key` after it failed verification
    pub(crate) fn discard(&self, key: &CacheKey) {
        if let Err(e) = self.storage.blocking().remove(&self.entry_dir(key)) {
            warn!("Failed to discard cache entry {}: {}", key.short(), e);
        }
    }

    pub(crate) async fn discard_async(&self, key: &CacheKey) {
        if let Err(e) = self.storage.suspending().remove(&self.entry_dir(key)).await {
            warn!("Failed to discard cache entry {}: {}", key.short(), e);
        }
    }

    pub(crate) fn lock_blocking(
        &self,
        key: &CacheKey,
        cancel: &CancellationToken,
    ) -> Option<LockFile> {
        self.locks
            .as_ref()
            .and_then(|settings| LockFile::acquire_blocking(settings, &key.to_hex(), cancel))
    }

    pub(crate) async fn lock(&self, key: &CacheKey, cancel: &CancellationToken) -> Option<LockFile> {
        match &self.locks {
            Some(settings) => LockFile::acquire(settings, &key.to_hex(), cancel).await,
            None => None,
        }
    }

    fn served(&self, key: &CacheKey, entry: &CacheEntry) -> SimResult {
        let label = entry.result.label().to_string();
        entry.result.relocated(label, self.files_dir(key), true)
    }
}

fn decode(key: &CacheKey, bytes: &[u8]) -> Result<CacheEntry, CacheError> {
    let entry: CacheEntry =
        serde_json::from_slice(bytes).map_err(|e| corrupt(key, e.to_string()))?;
    entry.check(key).map_err(|reason| corrupt(key, reason))?;
    Ok(entry)
}

fn check_output(key: &CacheKey, relative: &Path) -> Result<(), CacheError> {
    if is_contained(relative) {
        Ok(())
    } else {
        Err(corrupt(
            key,
            format!("output {} is outside the run directory", relative.display()),
        ))
    }
}

fn corrupt(key: &CacheKey, reason: impl Into<String>) -> CacheError {
    CacheError::Corrupt {
        key: key.short(),
        reason: reason.into(),
    }
}

fn is_lock_dir(path: &Path) -> bool {
    path.file_name().is_some_and(|name| name == LOCK_DIR)
}

fn keys_from(entry_files: &[PathBuf]) -> Vec<CacheKey> {
    entry_files
        .iter()
        .filter_map(|path| path.parent()?.file_name()?.to_str()?.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use simbatch_core::{Execution, FailureReason};
    use std::sync::Arc;

    fn run_dir_with_output(dir: &Path, content: &str) -> SimResult {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("eplusout.csv"), content).unwrap();
        std::fs::write(dir.join("eplusout.err"), "** Warning ** none").unwrap();
        SimResult::from_execution(
            "office",
            dir,
            Execution {
                exit_code: Some(0),
                stdout: "EnergyPlus Completed Successfully".to_string(),
                output_files: vec!["eplusout.csv".into(), "eplusout.err".into()],
                ..Default::default()
            },
            None,
        )
    }

    fn key(byte: u8) -> CacheKey {
        CacheKey::from_bytes([byte; 32])
    }

    #[test]
    fn test_put_get_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ResultCache::local(tmp.path().join("cache"));
        let result = run_dir_with_output(&tmp.path().join("run"), "a,b\n1,2\n");

        assert!(!cache.contains(&key(1)));
        assert!(cache.put(&key(1), &result).unwrap());

        let cached = cache.get(&key(1)).unwrap();
        assert!(cached.from_cache());
        assert!(cached.success());
        assert_eq!(cached.output_files(), result.output_files());
        assert_eq!(cached.stdout(), result.stdout());
        assert_eq!(
            std::fs::read_to_string(cached.output_path("eplusout.csv")).unwrap(),
            "a,b\n1,2\n"
        );
        assert_eq!(cache.keys().unwrap(), vec![key(1)]);
    }

    #[test]
    fn test_put_is_write_once() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ResultCache::local(tmp.path().join("cache"));
        let first = run_dir_with_output(&tmp.path().join("run1"), "first");
        let second = run_dir_with_output(&tmp.path().join("run2"), "second");

        assert!(cache.put(&key(1), &first).unwrap());
        assert!(!cache.put(&key(1), &second).unwrap());

        let cached = cache.get(&key(1)).unwrap();
        assert_eq!(
            std::fs::read_to_string(cached.output_path("eplusout.csv")).unwrap(),
            "first"
        );
    }

    #[test]
    fn test_failed_results_not_stored() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ResultCache::local(tmp.path());
        let failed = SimResult::failed("x", tmp.path(), FailureReason::Cancelled, Duration::ZERO);

        assert!(!cache.put(&key(1), &failed).unwrap());
        assert!(!cache.contains(&key(1)));
    }

    #[test]
    fn test_corrupt_entry_is_miss() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ResultCache::local(tmp.path().join("cache"));
        let result = run_dir_with_output(&tmp.path().join("run"), "data");
        cache.put(&key(1), &result).unwrap();

        std::fs::write(cache.entry_file(&key(1)), "{ not json").unwrap();
        assert!(cache.get(&key(1)).is_none());

        // A later put repairs the entry
        assert!(cache.put(&key(1), &result).unwrap());
        assert!(cache.get(&key(1)).is_some());
    }

    #[test]
    fn test_missing_file_is_miss() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ResultCache::local(tmp.path().join("cache"));
        let result = run_dir_with_output(&tmp.path().join("run"), "data");
        cache.put(&key(1), &result).unwrap();

        std::fs::remove_file(cache.files_dir(&key(1)).join("eplusout.csv")).unwrap();
        assert!(!cache.contains(&key(1)));
    }

    #[test]
    fn test_materialize_verifies_content() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ResultCache::local(tmp.path().join("cache"));
        let result = run_dir_with_output(&tmp.path().join("run"), "data");
        cache.put(&key(1), &result).unwrap();

        let entry = cache.lookup(&key(1)).unwrap();
        let target = tmp.path().join("copy");
        cache.materialize(&entry, &target).unwrap();
        assert_eq!(
            std::fs::read_to_string(target.join("eplusout.csv")).unwrap(),
            "data"
        );

        std::fs::write(cache.files_dir(&key(1)).join("eplusout.csv"), "tampered").unwrap();
        let err = cache.materialize(&entry, &tmp.path().join("copy2")).unwrap_err();
        assert!(matches!(err, CacheError::Corrupt { .. }));
    }

    #[test]
    fn test_clear_removes_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ResultCache::local(tmp.path().join("cache"));
        let result = run_dir_with_output(&tmp.path().join("run"), "data");
        cache.put(&key(1), &result).unwrap();
        cache.put(&key(2), &result).unwrap();

        cache.clear().unwrap();
        assert!(!cache.contains(&key(1)));
        assert!(!cache.contains(&key(2)));
        assert!(cache.keys().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_async_roundtrip_on_object_store() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = StorageBackend::object_store(Arc::new(InMemory::new()), "bucket").unwrap();
        let cache = ResultCache::new(storage, "results");
        let result = run_dir_with_output(&tmp.path().join("run"), "remote");

        assert!(cache.put_async(&key(4), &result).await.unwrap());
        assert!(cache.contains_async(&key(4)).await);

        let entry = cache.lookup_async(&key(4)).await.unwrap();
        let target = tmp.path().join("local");
        cache.materialize_async(&entry, &target).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(target.join("eplusout.csv")).unwrap(),
            "remote"
        );

        cache.clear_async().await.unwrap();
        assert!(cache.get_async(&key(4)).await.is_none());
    }
}
