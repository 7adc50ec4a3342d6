//! Local filesystem storage implementation.
//!
//! One JSON file per target key under `{root}/snapshots/`. Writes go to a
//! per-key temp file that is renamed over the record, so a crash mid-write
//! leaves the previous record intact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::models::{NotificationEvent, Snapshot, TargetKey};
use crate::storage::{SnapshotStore, StoredRecord};

/// Local filesystem storage backend.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root_dir: PathBuf,
}

impl LocalStorage {
    /// Create a new LocalStorage rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    /// Get the full path for a relative key.
    fn path(&self, key: &str) -> PathBuf {
        self.root_dir.join(key)
    }

    fn record_key(key: &TargetKey) -> String {
        format!("snapshots/{}.json", key.as_str())
    }

    /// Ensure parent directory exists.
    async fn ensure_dir(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Flush a directory entry change (a rename) to disk.
    #[cfg(unix)]
    async fn sync_dir(dir: &Path) -> Result<()> {
        tokio::fs::File::open(dir).await?.sync_all().await?;
        Ok(())
    }

    #[cfg(not(unix))]
    async fn sync_dir(_dir: &Path) -> Result<()> {
        Ok(())
    }

    /// Write bytes atomically (write to temp, sync, rename, sync the directory).
    async fn write_bytes(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(key);
        self.ensure_dir(&path).await?;

        let tmp = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        if let Some(parent) = path.parent() {
            Self::sync_dir(parent).await?;
        }
        Ok(())
    }

    /// Write JSON data.
    async fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_bytes(key, &bytes).await
    }

    /// Read bytes, returning None if file doesn't exist.
    async fn read_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    /// Read JSON data.
    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.read_bytes(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SnapshotStore for LocalStorage {
    async fn load_record(&self, key: &TargetKey) -> Result<Option<StoredRecord>> {
        self.read_json(&Self::record_key(key))
            .await
            .map_err(|e| AppError::persistence(key.as_str(), e))
    }

    async fn commit(
        &self,
        key: &TargetKey,
        snapshot: &Snapshot,
        pending: &[NotificationEvent],
    ) -> Result<()> {
        let record = StoredRecord::new(snapshot.clone(), pending.to_vec());
        self.write_json(&Self::record_key(key), &record)
            .await
            .map_err(|e| AppError::persistence(key.as_str(), e))?;
        log::debug!(
            "Stored snapshot for {}: {} slot(s), {} pending event(s)",
            key,
            snapshot.len(),
            pending.len()
        );
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<TargetKey>> {
        let dir = self.path("snapshots");
        let mut keys = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(AppError::persistence("snapshots", e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AppError::persistence("snapshots", e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(stem) = name.strip_suffix(".json") {
                keys.push(TargetKey::from(stem));
            }
        }
        keys.sort();
        Ok(keys)
    }
}
