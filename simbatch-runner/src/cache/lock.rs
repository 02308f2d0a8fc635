//! Cross-process advisory lock files for local cache keys
//!
//! A lock is a file created with `create_new` under `<cache>/.locks`. Waits
//! are bounded: after `timeout` the caller proceeds without the lock, and a
//! lock file older than `stale_after` is assumed abandoned and removed.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub(crate) struct LockSettings {
    pub dir: PathBuf,
    pub timeout: Duration,
    pub stale_after: Duration,
}

/// Held lock; the file is removed on drop
#[derive(Debug)]
pub(crate) struct LockFile {
    path: PathBuf,
}

enum Attempt {
    Acquired(LockFile),
    Busy,
    Failed,
}

impl LockFile {
    /// Acquires the lock for `name`, blocking the current thread
    ///
    /// Returns `None` when the wait timed out, `cancel` fired or the lock
    /// directory is unusable; the caller then runs unlocked unless cancelled.
    pub fn acquire_blocking(
        settings: &LockSettings,
        name: &str,
        cancel: &CancellationToken,
    ) -> Option<LockFile> {
        let path = settings.dir.join(format!("{}.lock", name));
        let deadline = Instant::now() + settings.timeout;
        loop {
            if cancel.is_cancelled() {
                debug!("Cancelled while waiting for {}", path.display());
                return None;
            }
            match attempt(&path, settings) {
                Attempt::Acquired(lock) => return Some(lock),
                Attempt::Failed => return None,
                Attempt::Busy if Instant::now() >= deadline => {
                    warn!("Timed out waiting for {}, continuing unlocked", path.display());
                    return None;
                }
                Attempt::Busy => std::thread::sleep(RETRY_INTERVAL),
            }
        }
    }

    /// Async variant of [`LockFile::acquire_blocking`]
    pub async fn acquire(
        settings: &LockSettings,
        name: &str,
        cancel: &CancellationToken,
    ) -> Option<LockFile> {
        let path = settings.dir.join(format!("{}.lock", name));
        let deadline = Instant::now() + settings.timeout;
        loop {
            if cancel.is_cancelled() {
                debug!("Cancelled while waiting for {}", path.display());
                return None;
            }
            match attempt(&path, settings) {
                Attempt::Acquired(lock) => return Some(lock),
                Attempt::Failed => return None,
                Attempt::Busy if Instant::now() >= deadline => {
                    warn!("Timed out waiting for {}, continuing unlocked", path.display());
                    return None;
                }
                Attempt::Busy => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                    }
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove lock {}: {}", self.path.display(), e);
            }
        }
    }
}

fn attempt(path: &Path, settings: &LockSettings) -> Attempt {
    if let Err(e) = std::fs::create_dir_all(&settings.dir) {
        warn!("Cannot create lock directory {}: {}", settings.dir.display(), e);
        return Attempt::Failed;
    }

    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            let _ = writeln!(file, "{}", std::process::id());
            debug!("Acquired {}", path.display());
            Attempt::Acquired(LockFile {
                path: path.to_path_buf(),
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            if is_stale(path, settings.stale_after) {
                warn!("Breaking stale lock {}", path.display());
                let _ = std::fs::remove_file(path);
            }
            Attempt::Busy
        }
        Err(e) => {
            warn!("Cannot create lock {}: {}", path.display(), e);
            Attempt::Failed
        }
    }
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > stale_after)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dir: &Path, timeout: Duration, stale_after: Duration) -> LockSettings {
        LockSettings {
            dir: dir.join(".locks"),
            timeout,
            stale_after,
        }
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), Duration::from_secs(1), Duration::from_secs(60));

        let lock = LockFile::acquire_blocking(&settings, "abc", &CancellationToken::new()).unwrap();
        assert!(lock.path().exists());
        let path = lock.path().to_path_buf();
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_busy_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), Duration::from_millis(250), Duration::from_secs(60));

        let _held = LockFile::acquire_blocking(&settings, "abc", &CancellationToken::new()).unwrap();
        let started = Instant::now();
        assert!(LockFile::acquire_blocking(&settings, "abc", &CancellationToken::new()).is_none());
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), Duration::from_secs(2), Duration::from_millis(100));
        std::fs::create_dir_all(&settings.dir).unwrap();
        std::fs::write(settings.dir.join("abc.lock"), "99999").unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let lock = LockFile::acquire(&settings, "abc", &CancellationToken::new()).await;
        assert!(lock.is_some());
    }

    #[test]
    fn test_cancel_ends_blocking_wait() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), Duration::from_secs(60), Duration::from_secs(600));
        let _held = LockFile::acquire_blocking(&settings, "abc", &CancellationToken::new()).unwrap();

        let cancel = CancellationToken::new();
        let started = Instant::now();
        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| LockFile::acquire_blocking(&settings, "abc", &cancel));
            std::thread::sleep(Duration::from_millis(150));
            cancel.cancel();
            assert!(waiter.join().unwrap().is_none());
        });
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancel_ends_async_wait() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), Duration::from_secs(60), Duration::from_secs(600));
        let _held = LockFile::acquire(&settings, "abc", &CancellationToken::new())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });

        let waited = tokio::time::timeout(
            Duration::from_secs(5),
            LockFile::acquire(&settings, "abc", &cancel),
        )
        .await;
        assert!(matches!(waited, Ok(None)));
    }
}
