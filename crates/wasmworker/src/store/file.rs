//! On-disk storage backend.
//!
//! One file per key under a root directory. Short keys are stored under the
//! hex encoding of the key; keys whose encoding would exceed a file name are
//! stored under `h-` and the blake3 digest of the key. Hex names never
//! contain `-`, so the two schemes cannot collide.

use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use crate::store::DataStore;
use crate::store::Error;
use crate::store::Result;

/// Longest hex-encoded name, well under the common 255-byte limit.
const MAX_HEX_NAME: usize = 200;

#[derive(Clone, Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens a store rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root.join(file_name(key)?))
    }
}

/// The file name `key` is stored under.
pub fn file_name(key: &str) -> Result<String> {
    if key.is_empty() {
        return Err(Error::InvalidKey(key.to_string()));
    }
    if key.len() * 2 > MAX_HEX_NAME {
        return Ok(format!("h-{}", blake3::hash(key.as_bytes()).to_hex()));
    }
    Ok(key.bytes().map(|b| format!("{:02x}", b)).collect())
}

#[async_trait::async_trait]
impl DataStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        let root = self.root.clone();
        // readers never observe a partial value, and concurrent writers of
        // one key each get their own temporary file
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&root)?;
            tmp.write_all(&value)?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))??;
        Ok(())
    }
}
