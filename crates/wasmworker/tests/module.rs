//! `WasmModule` against a real wasmtime instance.

use std::sync::Arc;

use wasmworker::DataStore;
use wasmworker::MemoryStore;
use wasmworker::ModuleConfig;
use wasmworker::WasmModule;
use wasmworker::asyncify;
use wasmworker::asyncify::Phase;
use wasmworker::module::Error;

const BRIDGE_WAT: &str = include_str!("fixtures/bridge.wat");

const HELLO: u32 = 1024;
const ANSWER_KEY: u32 = 2048;
const MISSING_KEY: u32 = 2064;
const SCRATCH: u32 = 4096;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn module_with(store: MemoryStore) -> WasmModule {
    init_tracing();
    let mut module = WasmModule::new(BRIDGE_WAT.as_bytes(), Arc::new(store), ModuleConfig::new()).unwrap();
    module.init(20, 8192).unwrap();
    module
}

fn read_u32(module: &mut WasmModule, addr: u32) -> u32 {
    let bytes = module.get_memory_slice(addr, addr + 4).unwrap();
    u32::from_le_bytes(bytes.try_into().unwrap())
}

#[test]
fn test_init_creates_requested_memory() {
    let mut module = module_with(MemoryStore::new());
    assert!(module.is_initialized());
    assert_eq!(module.memory_size().unwrap(), 20 * 65536);
    assert_eq!(module.bridge_phase(), Some(Phase::Idle));
}

#[test]
fn test_lifecycle_errors() {
    init_tracing();
    let mut module = WasmModule::new(BRIDGE_WAT.as_bytes(), Arc::new(MemoryStore::new()), ModuleConfig::new()).unwrap();
    assert!(matches!(module.call("add", &[1, 2]), Err(Error::NotInitialized)));
    assert_eq!(module.bridge_phase(), None);

    module.init(20, 8192).unwrap();
    assert!(matches!(module.init(20, 8192), Err(Error::AlreadyInitialized)));
    assert!(matches!(module.call("nope", &[]), Err(Error::ExportNotFound(name)) if name == "nope"));

    module.destroy().unwrap();
    assert!(!module.is_initialized());
    assert!(matches!(module.memory_size(), Err(Error::NotInitialized)));
}

#[test]
fn test_compile_error_is_reported() {
    let result = WasmModule::new(b"(module (func", Arc::new(MemoryStore::new()), ModuleConfig::new());
    assert!(matches!(result, Err(Error::Compile(_))));
}

#[test]
fn test_sync_call_and_memory_access() {
    let mut module = module_with(MemoryStore::new());

    assert_eq!(module.call("add", &[40, 2]).unwrap(), 42);
    assert_eq!(module.call("hello", &[]).unwrap(), 0);
    assert_eq!(module.get_memory_as_string(HELLO).unwrap(), "hello from wasm");

    module.write_memory(&[1, 2, 3], SCRATCH).unwrap();
    assert_eq!(module.get_memory_slice(SCRATCH, SCRATCH + 3).unwrap(), vec![1, 2, 3]);

    let size = module.memory_size().unwrap() as u32;
    assert!(matches!(module.get_memory_slice(size - 2, size + 2), Err(Error::OutOfBounds { .. })));
    assert!(matches!(module.write_memory(&[0; 8], size - 4), Err(Error::OutOfBounds { .. })));
}

#[test]
fn test_trap_is_reported() {
    let mut module = module_with(MemoryStore::new());
    assert!(matches!(module.call("crash", &[]), Err(Error::Trap(_))));
    // a trap outside the bridge leaves it usable
    assert_eq!(module.call("add", &[1, 1]).unwrap(), 2);
}

#[tokio::test]
async fn test_async_call_loads_stored_value() {
    let store = MemoryStore::new();
    store.set("answer", b"forty-two".to_vec()).await.unwrap();
    let mut module = module_with(store);

    let addr = module.async_call("load", &[ANSWER_KEY, SCRATCH]).await.unwrap();

    assert_ne!(addr, 0);
    assert_eq!(read_u32(&mut module, SCRATCH), 9);
    assert_eq!(module.get_memory_slice(addr, addr + 9).unwrap(), b"forty-two".to_vec());
    assert_eq!(module.bridge_phase(), Some(Phase::Idle));
}

#[tokio::test]
async fn test_async_call_missing_key_writes_zero_length() {
    let mut module = module_with(MemoryStore::new());
    module.write_memory(&[0xAA; 4], SCRATCH).unwrap();

    let addr = module.async_call("load", &[MISSING_KEY, SCRATCH]).await.unwrap();

    assert_eq!(addr, 0);
    assert_eq!(read_u32(&mut module, SCRATCH), 0);
}

#[tokio::test]
async fn test_set_then_get_round_trip() {
    let store = MemoryStore::new();
    let mut module = module_with(store.clone());

    let key = SCRATCH;
    let data = SCRATCH + 64;
    let out = SCRATCH + 128;
    module.write_memory(b"witness\0", key).unwrap();
    module.write_memory(&[5, 4, 3, 2, 1], data).unwrap();

    let addr = module.async_call("roundtrip", &[key, data, 5, out]).await.unwrap();

    assert_eq!(store.peek("witness"), Some(vec![5, 4, 3, 2, 1]));
    assert_eq!(read_u32(&mut module, out), 5);
    assert_eq!(module.get_memory_slice(addr, addr + 5).unwrap(), vec![5, 4, 3, 2, 1]);

    // the instance is ready for the next call
    let again = module.async_call("load", &[key, out]).await.unwrap();
    assert_eq!(module.get_memory_slice(again, again + 5).unwrap(), vec![5, 4, 3, 2, 1]);
}

#[test]
fn test_sync_call_cannot_suspend() {
    let mut module = module_with(MemoryStore::new());
    match module.call("load", &[ANSWER_KEY, SCRATCH]) {
        Err(Error::Bridge(asyncify::Error::NotDriven { import })) => assert_eq!(import, "get_data"),
        other => panic!("Expected NotDriven, got {:?}", other),
    }
    assert_eq!(module.bridge_phase(), Some(Phase::Idle));
}

#[tokio::test]
async fn test_double_suspension_poisons_instance() {
    let mut module = module_with(MemoryStore::new());

    match module.async_call("double_load", &[ANSWER_KEY, SCRATCH]).await {
        Err(Error::Bridge(asyncify::Error::AlreadySuspended { .. })) => {}
        other => panic!("Expected AlreadySuspended, got {:?}", other),
    }
    assert_eq!(module.bridge_phase(), Some(Phase::Poisoned));
    assert!(matches!(
        module.async_call("add", &[1, 2]).await,
        Err(Error::Bridge(asyncify::Error::Poisoned))
    ));
}
