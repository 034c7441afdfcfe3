//! Storage layer
//!
//! One isolated SQLite file per account plus one shared file for the
//! account registry, all under the configured data directory.

pub mod migrations;
pub mod store;

pub use store::{object_types, SharedStore, Store};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::HeimdallResult;

/// Opens and caches the shared store and the per-account stores
pub struct StorageManager {
    data_dir: PathBuf,
    shared: Arc<SharedStore>,
    stores: Mutex<HashMap<Uuid, Arc<Store>>>,
}

impl StorageManager {
    /// Open the storage layer rooted at `data_dir`
    pub fn open(data_dir: PathBuf) -> HeimdallResult<Self> {
        std::fs::create_dir_all(&data_dir)?;
        let shared = Arc::new(SharedStore::open(&data_dir.join("shared.db"))?);
        Ok(Self { data_dir, shared, stores: Mutex::new(HashMap::new()) })
    }

    /// The shared account registry
    pub fn shared(&self) -> Arc<SharedStore> {
        self.shared.clone()
    }

    /// The isolated store for one account, opened on first use
    pub async fn store_for_account(&self, account_id: Uuid) -> HeimdallResult<Arc<Store>> {
        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(&account_id) {
            return Ok(store.clone());
        }
        let path = self.data_dir.join(format!("account-{account_id}.db"));
        let store = Arc::new(Store::open(account_id, &path)?);
        stores.insert(account_id, store.clone());
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stores_are_cached_per_account() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StorageManager::open(dir.path().to_path_buf()).unwrap();
        let account_id = Uuid::new_v4();

        let first = manager.store_for_account(account_id).await.unwrap();
        let second = manager.store_for_account(account_id).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = manager.store_for_account(Uuid::new_v4()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }
}
