//! # Key-Value storage backends
//!
//! Storage the host imports reach into while a module call is suspended.
//! Which backend sits behind a module is opaque to the bridge.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    InvalidKey(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "Storage I/O error: {}", e),
            Self::InvalidKey(key) => write!(f, "Invalid storage key: {:?}", key),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// An asynchronous byte store keyed by string.
///
/// # Invariants
/// - A missing key is `Ok(None)`, never an error.
/// - `get` after a completed `set` of the same key returns the same bytes.
#[async_trait::async_trait]
pub trait DataStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
}
