use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{validate_keys, Storage, StorageResult};

/// In-memory implementation for tests and single-process hosts.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.items.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, keys: &[String]) -> StorageResult<BTreeMap<String, Value>> {
        validate_keys(keys)?;
        let items = self.items.read().await;
        Ok(keys
            .iter()
            .filter_map(|key| items.get(key).map(|value| (key.clone(), value.clone())))
            .collect())
    }

    async fn write(&self, changes: BTreeMap<String, Value>) -> StorageResult<()> {
        validate_keys(changes.keys())?;
        self.items.write().await.extend(changes);
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> StorageResult<()> {
        validate_keys(keys)?;
        let mut items = self.items.write().await;
        for key in keys {
            items.remove(key);
        }
        Ok(())
    }
}
