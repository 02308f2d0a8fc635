//! One behavioral suite run against every storage implementation.

use object_store::memory::InMemory;
use simbatch_storage::{
    AsyncLocalStorage, AsyncStorage, BlockingObjectStorage, LocalStorage, ObjectStorage, Storage,
    StorageError,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn names(found: &[PathBuf], root: &Path) -> Vec<String> {
    found
        .iter()
        .map(|p| {
            p.strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect()
}

fn blocking_suite(storage: &dyn Storage, root: &Path) {
    // write then read
    let model = root.join("inputs/model.idf");
    storage.write_text(&model, "Version,24.1;").unwrap();
    assert_eq!(storage.read_text(&model).unwrap(), "Version,24.1;");
    assert!(storage.exists(&model).unwrap());

    // missing paths
    let missing = root.join("inputs/missing.idf");
    assert!(!storage.exists(&missing).unwrap());
    assert!(storage.read_bytes(&missing).unwrap_err().is_not_found());

    // invalid utf-8
    let binary = root.join("inputs/blob.bin");
    storage.write_bytes(&binary, &[0xff, 0xfe, 0x00]).unwrap();
    assert!(matches!(
        storage.read_text(&binary),
        Err(StorageError::InvalidUtf8(_))
    ));

    // copy leaves the source untouched
    storage.make_dirs(&root.join("copies")).unwrap();
    let copied = root.join("copies/model.idf");
    storage.copy(&model, &copied).unwrap();
    assert_eq!(storage.read_text(&copied).unwrap(), "Version,24.1;");
    assert_eq!(storage.read_text(&model).unwrap(), "Version,24.1;");

    // glob stays at one level unless the pattern descends
    let outputs = root.join("outputs");
    storage.write_text(&outputs.join("a.csv"), "a").unwrap();
    storage.write_text(&outputs.join("b.csv"), "b").unwrap();
    storage.write_text(&outputs.join("c.err"), "c").unwrap();
    storage.write_text(&outputs.join("sub/d.csv"), "d").unwrap();
    assert_eq!(
        names(&storage.glob(&outputs, "*.csv").unwrap(), &outputs),
        vec!["a.csv", "b.csv"]
    );
    assert_eq!(
        names(&storage.glob(&outputs, "sub/*.csv").unwrap(), &outputs),
        vec!["sub/d.csv"]
    );

    // remove is a no-op on missing paths and recursive on trees
    storage.remove(&missing).unwrap();
    storage.remove(&outputs.join("c.err")).unwrap();
    assert!(!storage.exists(&outputs.join("c.err")).unwrap());
    storage.remove(&outputs).unwrap();
    assert!(storage.glob(&outputs, "*").unwrap().is_empty());
    assert!(!storage.exists(&outputs.join("sub/d.csv")).unwrap());
}

async fn async_suite(storage: &dyn AsyncStorage, root: &Path) {
    let model = root.join("inputs/model.idf");
    storage.write_text(&model, "Version,24.1;").await.unwrap();
    assert_eq!(storage.read_text(&model).await.unwrap(), "Version,24.1;");
    assert!(storage.exists(&model).await.unwrap());

    let missing = root.join("inputs/missing.idf");
    assert!(!storage.exists(&missing).await.unwrap());
    assert!(storage.read_bytes(&missing).await.unwrap_err().is_not_found());

    let binary = root.join("inputs/blob.bin");
    storage.write_bytes(&binary, &[0xff, 0xfe, 0x00]).await.unwrap();
    assert!(matches!(
        storage.read_text(&binary).await,
        Err(StorageError::InvalidUtf8(_))
    ));

    storage.make_dirs(&root.join("copies")).await.unwrap();
    let copied = root.join("copies/model.idf");
    storage.copy(&model, &copied).await.unwrap();
    assert_eq!(storage.read_text(&copied).await.unwrap(), "Version,24.1;");
    assert_eq!(storage.read_text(&model).await.unwrap(), "Version,24.1;");

    let outputs = root.join("outputs");
    storage.write_text(&outputs.join("a.csv"), "a").await.unwrap();
    storage.write_text(&outputs.join("b.csv"), "b").await.unwrap();
    storage.write_text(&outputs.join("c.err"), "c").await.unwrap();
    storage.write_text(&outputs.join("sub/d.csv"), "d").await.unwrap();
    assert_eq!(
        names(&storage.glob(&outputs, "*.csv").await.unwrap(), &outputs),
        vec!["a.csv", "b.csv"]
    );
    assert_eq!(
        names(&storage.glob(&outputs, "sub/*.csv").await.unwrap(), &outputs),
        vec!["sub/d.csv"]
    );

    storage.remove(&missing).await.unwrap();
    storage.remove(&outputs.join("c.err")).await.unwrap();
    assert!(!storage.exists(&outputs.join("c.err")).await.unwrap());
    storage.remove(&outputs).await.unwrap();
    assert!(storage.glob(&outputs, "*").await.unwrap().is_empty());
    assert!(!storage.exists(&outputs.join("sub/d.csv")).await.unwrap());
}

fn in_memory(prefix: &str) -> ObjectStorage {
    ObjectStorage::new(Arc::new(InMemory::new()), prefix).unwrap()
}

#[test]
fn local_storage_conforms() {
    let dir = tempfile::tempdir().unwrap();
    blocking_suite(&LocalStorage::new(), dir.path());
}

#[test]
fn blocking_object_storage_conforms() {
    let storage = BlockingObjectStorage::new(in_memory("bucket/prefix"));
    blocking_suite(&storage, Path::new("suite"));
}

#[tokio::test(flavor = "multi_thread")]
async fn blocking_object_storage_conforms_inside_runtime() {
    let storage = BlockingObjectStorage::new(in_memory("bucket/prefix"));
    tokio::task::block_in_place(|| blocking_suite(&storage, Path::new("suite")));
}

#[tokio::test]
async fn blocking_object_storage_rejects_current_thread_runtime() {
    let storage = BlockingObjectStorage::new(in_memory("bucket/prefix"));
    let err = storage.write_text(Path::new("a.txt"), "hello").unwrap_err();
    assert!(matches!(err, StorageError::Runtime(_)));
}

#[tokio::test]
async fn async_local_storage_conforms() {
    let dir = tempfile::tempdir().unwrap();
    async_suite(&AsyncLocalStorage::new(), dir.path()).await;
}

#[tokio::test]
async fn object_storage_conforms() {
    async_suite(&in_memory("bucket/prefix"), Path::new("suite")).await;
}
