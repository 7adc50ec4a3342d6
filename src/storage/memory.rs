//! In-memory storage for dry runs and tests. Nothing survives the process.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::models::{NotificationEvent, Snapshot, TargetKey};
use crate::storage::{SnapshotStore, StoredRecord};

#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: RwLock<HashMap<TargetKey, StoredRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStorage {
    async fn load_record(&self, key: &TargetKey) -> Result<Option<StoredRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn commit(
        &self,
        key: &TargetKey,
        snapshot: &Snapshot,
        pending: &[NotificationEvent],
    ) -> Result<()> {
        let record = StoredRecord::new(snapshot.clone(), pending.to_vec());
        self.records.write().await.insert(key.clone(), record);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<TargetKey>> {
        let mut keys: Vec<_> = self.records.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
