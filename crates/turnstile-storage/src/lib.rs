//! Keyed storage contract and backends used for turn and sign-in state.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors returned by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage keys must not be empty")]
    InvalidKey,
    #[error("unsupported storage schema version {found} (expected {expected})")]
    UnsupportedSchema { found: u32, expected: u32 },
    #[error("storage backend failure: {0}")]
    Backend(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Async keyed storage used by turn state and sign-in persistence.
///
/// Reads omit missing keys. Deleting a missing key is a no-op.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, keys: &[String]) -> StorageResult<BTreeMap<String, Value>>;
    async fn write(&self, changes: BTreeMap<String, Value>) -> StorageResult<()>;
    async fn delete(&self, keys: &[String]) -> StorageResult<()>;
}

pub(crate) fn validate_keys<'a>(keys: impl IntoIterator<Item = &'a String>) -> StorageResult<()> {
    for key in keys {
        if key.trim().is_empty() {
            return Err(StorageError::InvalidKey);
        }
    }
    Ok(())
}

/// Reads and decodes a single key.
pub async fn read_typed<T>(storage: &dyn Storage, key: &str) -> StorageResult<Option<T>>
where
    T: DeserializeOwned,
{
    let key = key.to_string();
    let mut items = storage.read(std::slice::from_ref(&key)).await?;
    match items.remove(&key) {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Encodes and writes a single key.
pub async fn write_typed<T>(storage: &dyn Storage, key: &str, value: &T) -> StorageResult<()>
where
    T: Serialize,
{
    let value = serde_json::to_value(value)?;
    storage
        .write(BTreeMap::from([(key.to_string(), value)]))
        .await
}

pub async fn delete_key(storage: &dyn Storage, key: &str) -> StorageResult<()> {
    storage.delete(&[key.to_string()]).await
}
