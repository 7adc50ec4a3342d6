//! Dedup store: last-seen snapshot per target.
//!
//! Each target key owns exactly one record holding the latest snapshot and an
//! outbox of notification events that were detected but not yet delivered.
//! Records are always replaced whole; there is no merge path.
//!
//! ## Directory Structure (local backend)
//!
//! ```text
//! storage/
//! └── snapshots/
//!     ├── 3f9a0c1d2e4b5a6978a1b2c3d4e5f601.json
//!     └── 9b8c7d6e5f4a3b2c1d0e9f8a7b6c5d4e.json
//! ```

pub mod local;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{Config, NotificationEvent, Snapshot, StorageBackend, TargetKey};

// Re-export for convenience
pub use local::LocalStorage;
pub use memory::MemoryStorage;

/// What is persisted for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// When the record was written
    pub updated_at: DateTime<Utc>,

    /// Latest snapshot, the baseline for the next diff
    pub snapshot: Snapshot,

    /// Events detected against this snapshot that still await delivery
    #[serde(default)]
    pub pending: Vec<NotificationEvent>,
}

impl StoredRecord {
    pub fn new(snapshot: Snapshot, pending: Vec<NotificationEvent>) -> Self {
        Self {
            updated_at: Utc::now(),
            snapshot,
            pending,
        }
    }
}

/// Trait for snapshot storage backends.
///
/// Implementations must make `commit` an atomic replace: a reader sees either
/// the whole old record or the whole new one, and writes to different keys
/// never affect each other.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Read the full record for a key.
    async fn load_record(&self, key: &TargetKey) -> Result<Option<StoredRecord>>;

    /// Replace the snapshot and outbox for a key in one step.
    async fn commit(
        &self,
        key: &TargetKey,
        snapshot: &Snapshot,
        pending: &[NotificationEvent],
    ) -> Result<()>;

    /// Every key with a stored record.
    async fn keys(&self) -> Result<Vec<TargetKey>>;

    /// Latest snapshot for a key, if any was ever saved.
    async fn load(&self, key: &TargetKey) -> Result<Option<Snapshot>> {
        Ok(self.load_record(key).await?.map(|r| r.snapshot))
    }

    /// Replace the snapshot for a key, clearing its outbox.
    async fn save(&self, key: &TargetKey, snapshot: &Snapshot) -> Result<()> {
        self.commit(key, snapshot, &[]).await
    }

    /// Undelivered events for a key.
    async fn pending(&self, key: &TargetKey) -> Result<Vec<NotificationEvent>> {
        Ok(self
            .load_record(key)
            .await?
            .map(|r| r.pending)
            .unwrap_or_default())
    }
}

/// Build the configured store backend.
pub fn open(config: &Config) -> Arc<dyn SnapshotStore> {
    match config.storage.backend {
        StorageBackend::Local => Arc::new(LocalStorage::new(&config.storage.dir)),
        StorageBackend::Memory => Arc::new(MemoryStorage::new()),
    }
}
