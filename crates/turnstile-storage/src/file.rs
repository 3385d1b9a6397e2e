//! Single-document JSON storage under a root directory.
//!
//! Every write rewrites the whole document through a temp file + rename so a
//! crash never leaves a half-written store behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use turnstile_core::write_text_atomic;

use crate::{validate_keys, Storage, StorageError, StorageResult};

pub const FILE_STORAGE_FILE_NAME: &str = "turnstile-storage.json";
const FILE_STORAGE_SCHEMA_VERSION: u32 = 1;

fn file_storage_schema_version() -> u32 {
    FILE_STORAGE_SCHEMA_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct FileStorageDocument {
    #[serde(default = "file_storage_schema_version")]
    schema_version: u32,
    #[serde(default)]
    items: BTreeMap<String, Value>,
}

impl Default for FileStorageDocument {
    fn default() -> Self {
        Self {
            schema_version: FILE_STORAGE_SCHEMA_VERSION,
            items: BTreeMap::new(),
        }
    }
}

/// Public struct `FileStorage` used across turnstile components.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    guard: AsyncMutex<()>,
}

impl FileStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self::with_path(root.as_ref().join(FILE_STORAGE_FILE_NAME))
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: AsyncMutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs blocking file work off the async workers. Callers hold `guard`.
    async fn run_blocking<T, F>(&self, task: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> StorageResult<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || task(path.as_path()))
            .await
            .map_err(|error| StorageError::Backend(format!("file storage task failed: {error}")))?
    }
}

fn load_document(path: &Path) -> StorageResult<FileStorageDocument> {
    if !path.exists() {
        return Ok(FileStorageDocument::default());
    }
    let raw = std::fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        return Ok(FileStorageDocument::default());
    }
    let document = serde_json::from_str::<FileStorageDocument>(&raw)?;
    if document.schema_version != FILE_STORAGE_SCHEMA_VERSION {
        return Err(StorageError::UnsupportedSchema {
            found: document.schema_version,
            expected: FILE_STORAGE_SCHEMA_VERSION,
        });
    }
    Ok(document)
}

fn save_document(path: &Path, document: &FileStorageDocument) -> StorageResult<()> {
    let encoded = serde_json::to_string_pretty(document)?;
    write_text_atomic(path, &encoded).map_err(|error| StorageError::Backend(format!("{error:#}")))?;
    tracing::debug!(
        path = %path.display(),
        items = document.items.len(),
        "file storage saved"
    );
    Ok(())
}

#[async_trait]
impl Storage for FileStorage {
    async fn read(&self, keys: &[String]) -> StorageResult<BTreeMap<String, Value>> {
        validate_keys(keys)?;
        let keys = keys.to_vec();
        let _guard = self.guard.lock().await;
        self.run_blocking(move |path| {
            let mut document = load_document(path)?;
            Ok(keys
                .into_iter()
                .filter_map(|key| document.items.remove(&key).map(|value| (key, value)))
                .collect())
        })
        .await
    }

    async fn write(&self, changes: BTreeMap<String, Value>) -> StorageResult<()> {
        validate_keys(changes.keys())?;
        if changes.is_empty() {
            return Ok(());
        }
        let _guard = self.guard.lock().await;
        self.run_blocking(move |path| {
            let mut document = load_document(path)?;
            document.items.extend(changes);
            save_document(path, &document)
        })
        .await
    }

    async fn delete(&self, keys: &[String]) -> StorageResult<()> {
        validate_keys(keys)?;
        let keys = keys.to_vec();
        let _guard = self.guard.lock().await;
        self.run_blocking(move |path| {
            let mut document = load_document(path)?;
            let before = document.items.len();
            for key in &keys {
                document.items.remove(key);
            }
            if document.items.len() == before {
                return Ok(());
            }
            save_document(path, &document)
        })
        .await
    }
}
