//! Snapshot persistence across restarts

use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::MetricsSnapshot;
use crate::Result;

/// Durable home for metrics snapshots
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// Most recent snapshot, if any
    async fn load(&self) -> Result<Option<MetricsSnapshot>>;

    /// Append a snapshot
    async fn save(&self, snapshot: &MetricsSnapshot) -> Result<()>;
}

/// Discards snapshots
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSnapshotStore;

#[async_trait]
impl SnapshotStore for NoopSnapshotStore {
    async fn load(&self) -> Result<Option<MetricsSnapshot>> {
        Ok(None)
    }

    async fn save(&self, _snapshot: &MetricsSnapshot) -> Result<()> {
        Ok(())
    }
}

/// Keeps snapshots in memory
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    history: Mutex<Vec<MetricsSnapshot>>,
}

impl MemorySnapshotStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose latest snapshot is `snapshot`
    #[must_use]
    pub fn with_snapshot(snapshot: MetricsSnapshot) -> Self {
        Self {
            history: Mutex::new(vec![snapshot]),
        }
    }

    /// Everything saved so far
    #[must_use]
    pub fn history(&self) -> Vec<MetricsSnapshot> {
        self.history.lock().clone()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self) -> Result<Option<MetricsSnapshot>> {
        Ok(self.history.lock().last().cloned())
    }

    async fn save(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        self.history.lock().push(snapshot.clone());
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotFile {
    history: Vec<MetricsSnapshot>,
}

/// JSON file holding a bounded snapshot history
#[derive(Debug)]
pub struct FileSnapshotStore {
    path: PathBuf,
    history_limit: usize,
    // Serializes read-modify-write cycles from concurrent saves.
    write_lock: tokio::sync::Mutex<()>,
}

impl FileSnapshotStore {
    /// Store snapshots at `path`, keeping the last `history_limit`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, history_limit: usize) -> Self {
        Self {
            path: path.into(),
            history_limit: history_limit.max(1),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read(&self) -> Result<SnapshotFile> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SnapshotFile::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self) -> Result<Option<MetricsSnapshot>> {
        Ok(self.read().await?.history.pop())
    }

    async fn save(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.read().await?;
        file.history.push(snapshot.clone());
        let excess = file.history.len().saturating_sub(self.history_limit);
        file.history.drain(..excess);

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&file)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), entries = file.history.len(), "Metrics snapshot persisted");
        Ok(())
    }
}
