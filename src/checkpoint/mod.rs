//! Resume cursors.
//!
//! A checkpoint is the last log timestamp shipped for a container. Only
//! the cursor is persisted, never log content.

mod file;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

pub use file::FileCheckpointStore;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, container_id: &str) -> Result<Option<i64>, CheckpointError>;
    async fn set(&self, container_id: &str, timestamp: i64) -> Result<(), CheckpointError>;

    /// Removes cursors older than `older_than`, except those in `keep`.
    /// Returns how many were removed.
    async fn prune(
        &self,
        older_than: i64,
        keep: &HashSet<String>,
    ) -> Result<usize, CheckpointError>;
}

/// Opens the cursor file at `path`. An empty path keeps cursors in memory,
/// so nothing survives a restart.
pub async fn open_store(path: &Path) -> Result<Arc<dyn CheckpointStore>, CheckpointError> {
    if path.as_os_str().is_empty() {
        log::warn!("No checkpoint path configured, log cursors are kept in memory only");
        return Ok(Arc::new(MemoryCheckpointStore::new()));
    }
    Ok(Arc::new(FileCheckpointStore::open(path).await?))
}

/// Drops entries older than `older_than` that are not in `keep`.
fn retain_recent(
    cursors: &mut HashMap<String, i64>,
    older_than: i64,
    keep: &HashSet<String>,
) -> usize {
    let before = cursors.len();
    cursors.retain(|container_id, timestamp| {
        *timestamp >= older_than || keep.contains(container_id)
    });
    before - cursors.len()
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Keeps cursors in process memory only.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<HashMap<String, i64>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, container_id: &str) -> Result<Option<i64>, CheckpointError> {
        Ok(self.inner.lock().await.get(container_id).copied())
    }

    async fn set(&self, container_id: &str, timestamp: i64) -> Result<(), CheckpointError> {
        self.inner
            .lock()
            .await
            .insert(container_id.to_string(), timestamp);
        Ok(())
    }

    async fn prune(
        &self,
        older_than: i64,
        keep: &HashSet<String>,
    ) -> Result<usize, CheckpointError> {
        Ok(retain_recent(&mut *self.inner.lock().await, older_than, keep))
    }
}

#[async_trait]
impl<T: CheckpointStore + ?Sized> CheckpointStore for std::sync::Arc<T> {
    async fn get(&self, container_id: &str) -> Result<Option<i64>, CheckpointError> {
        (**self).get(container_id).await
    }

    async fn set(&self, container_id: &str, timestamp: i64) -> Result<(), CheckpointError> {
        (**self).set(container_id, timestamp).await
    }

    async fn prune(
        &self,
        older_than: i64,
        keep: &HashSet<String>,
    ) -> Result<usize, CheckpointError> {
        (**self).prune(older_than, keep).await
    }
}
