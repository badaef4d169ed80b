use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{CheckpointError, CheckpointStore, retain_recent};

/// Cursors stored as a single JSON object on disk.
///
/// Every write goes to a synced temp file that then replaces the cursor
/// file, so a crash mid-write leaves the previous cursors intact.
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    cursors: Mutex<HashMap<String, i64>>,
}

impl FileCheckpointStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref().to_path_buf();

        let cursors = match tokio::fs::read_to_string(&path).await {
            Ok(contents) if contents.trim().is_empty() => HashMap::new(),
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        log::info!("Loaded {} log cursors from {path:?}", cursors.len());

        Ok(Self {
            path,
            cursors: Mutex::new(cursors),
        })
    }

    fn temp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }

    async fn persist(&self, cursors: &HashMap<String, i64>) -> Result<(), CheckpointError> {
        let contents = serde_json::to_vec(cursors)?;
        let tmp = self.temp_path();

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&contents).await?;
        // Contents must be on disk before the rename publishes them
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, container_id: &str) -> Result<Option<i64>, CheckpointError> {
        Ok(self.cursors.lock().await.get(container_id).copied())
    }

    async fn set(&self, container_id: &str, timestamp: i64) -> Result<(), CheckpointError> {
        let mut cursors = self.cursors.lock().await;
        let previous = cursors.insert(container_id.to_string(), timestamp);

        if let Err(e) = self.persist(&cursors).await {
            // Keep memory and disk in agreement
            match previous {
                Some(previous) => cursors.insert(container_id.to_string(), previous),
                None => cursors.remove(container_id),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn prune(
        &self,
        older_than: i64,
        keep: &HashSet<String>,
    ) -> Result<usize, CheckpointError> {
        let mut cursors = self.cursors.lock().await;
        let mut pruned = cursors.clone();
        let removed = retain_recent(&mut pruned, older_than, keep);
        if removed == 0 {
            return Ok(0);
        }
        self.persist(&pruned).await?;
        *cursors = pruned;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("logship-cursors-{}.json", uuid::Uuid::now_v7()))
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_store() {
        let path = temp_path();
        let store = FileCheckpointStore::open(&path)
            .await
            .expect("Failed to open store");
        assert_eq!(store.get("c1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cursors_survive_reopen() {
        let path = temp_path();

        let store = FileCheckpointStore::open(&path).await.unwrap();
        store.set("c1", 110).await.unwrap();
        store.set("c2", 42).await.unwrap();
        drop(store);

        let reopened = FileCheckpointStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("c1").await.unwrap(), Some(110));
        assert_eq!(reopened.get("c2").await.unwrap(), Some(42));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_write_leaves_no_temp_file() {
        let path = temp_path();
        let store = FileCheckpointStore::open(&path).await.unwrap();
        store.set("c1", 110).await.unwrap();

        assert!(path.exists());
        assert!(!store.temp_path().exists());
        let on_disk: HashMap<String, i64> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk.get("c1"), Some(&110));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_prune_survives_reopen() {
        let path = temp_path();
        let store = FileCheckpointStore::open(&path).await.unwrap();
        store.set("old", 10).await.unwrap();
        store.set("live", 10).await.unwrap();
        store.set("recent", 500).await.unwrap();

        let keep = HashSet::from(["live".to_string()]);
        assert_eq!(store.prune(100, &keep).await.unwrap(), 1);
        assert_eq!(store.prune(100, &keep).await.unwrap(), 0);
        drop(store);

        let reopened = FileCheckpointStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("old").await.unwrap(), None);
        assert_eq!(reopened.get("live").await.unwrap(), Some(10));
        assert_eq!(reopened.get("recent").await.unwrap(), Some(500));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let path = temp_path();
        std::fs::write(&path, "{not json").unwrap();

        let res = FileCheckpointStore::open(&path).await;
        assert!(matches!(res, Err(CheckpointError::Json(_))), "{res:?}");

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back() {
        let dir = std::env::temp_dir().join(format!("logship-missing-{}", uuid::Uuid::now_v7()));
        let store = FileCheckpointStore::open(dir.join("cursors.json")).await.unwrap();

        let res = store.set("c1", 110).await;
        assert!(matches!(res, Err(CheckpointError::Io(_))), "{res:?}");
        assert_eq!(store.get("c1").await.unwrap(), None);
    }
}
