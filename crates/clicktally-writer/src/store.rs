// Durable key-value storage for buffer snapshots
//
// Backed by OpenDAL so the same code writes to a local directory or to an
// in-memory map (tests, ephemeral hosts).

use crate::error::{Result, WriterError};
use async_trait::async_trait;
use clicktally_config::{StorageBackend, StorageConfig};
use opendal::{services, ErrorKind, Operator};

/// Minimal string store the pipeline persists its buffer into.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn write(&self, key: &str, value: String) -> Result<()>;

    /// Returns `None` when nothing is stored under `key`.
    async fn read(&self, key: &str) -> Result<Option<String>>;

    /// Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct OpenDalStore {
    operator: Operator,
}

impl OpenDalStore {
    /// Create storage for local filesystem
    pub fn new_fs(root: &str) -> Result<Self> {
        let builder = services::Fs::default().root(root);
        let operator = Operator::new(builder)
            .map_err(|e| WriterError::storage("init", root, e.to_string()))?
            .finish();
        Ok(Self { operator })
    }

    /// Create process-local storage
    pub fn new_memory() -> Result<Self> {
        let operator = Operator::new(services::Memory::default())
            .map_err(|e| WriterError::storage("init", "memory", e.to_string()))?
            .finish();
        Ok(Self { operator })
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        match config.backend {
            StorageBackend::Fs => Self::new_fs(&config.path),
            StorageBackend::Memory => Self::new_memory(),
        }
    }
}

#[async_trait]
impl SnapshotStore for OpenDalStore {
    async fn write(&self, key: &str, value: String) -> Result<()> {
        self.operator
            .write(key, value.into_bytes())
            .await
            .map_err(|e| WriterError::storage("write", key, e.to_string()))?;
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<String>> {
        match self.operator.read(key).await {
            Ok(data) => String::from_utf8(data.to_vec())
                .map(Some)
                .map_err(|e| WriterError::storage("read", key, e.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(WriterError::storage("read", key, e.to_string())),
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match self.operator.delete(key).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WriterError::storage("remove", key, e.to_string())),
        }
    }
}
