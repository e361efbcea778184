//! Storage backends, alone and behind a module.

use std::sync::Arc;

use wasmworker::DataStore;
use wasmworker::FileStore;
use wasmworker::MemoryStore;
use wasmworker::ModuleConfig;
use wasmworker::WasmModule;
use wasmworker::store::Error as StoreError;
use wasmworker::store::file::file_name;

const BRIDGE_WAT: &str = include_str!("fixtures/bridge.wat");

#[tokio::test]
async fn test_file_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path().join("data")).await.unwrap();

    assert_eq!(store.get("crs/g1").await.unwrap(), None);

    store.set("crs/g1", vec![1, 2, 3]).await.unwrap();
    assert_eq!(store.get("crs/g1").await.unwrap(), Some(vec![1, 2, 3]));

    store.set("crs/g1", vec![]).await.unwrap();
    assert_eq!(store.get("crs/g1").await.unwrap(), Some(vec![]));
}

#[tokio::test]
async fn test_file_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = FileStore::open(dir.path()).await.unwrap();
        store.set("key with spaces", b"value".to_vec()).await.unwrap();
    }
    let reopened = FileStore::open(dir.path()).await.unwrap();
    assert_eq!(reopened.get("key with spaces").await.unwrap(), Some(b"value".to_vec()));
}

#[tokio::test]
async fn test_file_store_rejects_empty_key() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).await.unwrap();
    assert!(matches!(store.get("").await, Err(StoreError::InvalidKey(_))));
    assert!(matches!(store.set("", vec![1]).await, Err(StoreError::InvalidKey(_))));
}

#[tokio::test]
async fn test_file_store_accepts_long_keys() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).await.unwrap();
    let long = "k".repeat(4096);
    let other = format!("{}x", "k".repeat(4095));

    store.set(&long, vec![1]).await.unwrap();
    store.set(&other, vec![2]).await.unwrap();

    assert_eq!(store.get(&long).await.unwrap(), Some(vec![1]));
    assert_eq!(store.get(&other).await.unwrap(), Some(vec![2]));
    assert!(file_name(&long).unwrap().len() < 255);
    assert_eq!(file_name("ab").unwrap(), "6162");
}

#[tokio::test]
async fn test_file_store_concurrent_writes_to_one_key() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).await.unwrap();

    let writes = (0..16u8).map(|i| {
        let store = store.clone();
        tokio::spawn(async move { store.set("shared", vec![i; 1024]).await })
    });
    for write in writes.collect::<Vec<_>>() {
        write.await.unwrap().unwrap();
    }

    // one whole value survives, never a mix
    let value = store.get("shared").await.unwrap().unwrap();
    assert_eq!(value.len(), 1024);
    assert!(value.iter().all(|b| *b == value[0]));
    // no temporary files are left behind
    let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        names.push(entry.file_name());
    }
    assert_eq!(names.len(), 1);
}

#[tokio::test]
async fn test_memory_store_handles_share_entries() {
    let store = MemoryStore::new();
    let handle = store.clone();
    store.set("a", vec![1]).await.unwrap();

    assert_eq!(handle.peek("a"), Some(vec![1]));
    assert_eq!(handle.len(), 1);
    assert_eq!(handle.get("b").await.unwrap(), None);
}

#[tokio::test]
async fn test_module_writes_through_to_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).await.unwrap();
    let mut module = WasmModule::new(BRIDGE_WAT.as_bytes(), Arc::new(store.clone()), ModuleConfig::new()).unwrap();
    module.init(20, 8192).unwrap();

    let key = 4096;
    let data = 4160;
    let out = 4224;
    module.write_memory(b"srs\0", key).unwrap();
    module.write_memory(&[7; 32], data).unwrap();

    let addr = module.async_call("roundtrip", &[key, data, 32, out]).await.unwrap();

    assert_eq!(store.get("srs").await.unwrap(), Some(vec![7; 32]));
    assert_eq!(module.get_memory_slice(addr, addr + 32).unwrap(), vec![7; 32]);
}
