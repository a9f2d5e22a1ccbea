//! JsonFileStore - 1 key = 1 JSON ファイルの KvStore
//!
//! 書き込みは `<key>.json.tmp` に書いて fsync してから rename するので、途中で
//! プロセスや電源が落ちても前回の値か今回の値のどちらかが残ります。

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::ports::{KvStore, StoreError};

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(format!("{key}.json")))
    }
}

fn io_error(key: &str, source: std::io::Error) -> StoreError {
    StoreError::Io {
        key: key.to_string(),
        source,
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

/// Persist the rename itself. Directories cannot be opened for sync everywhere.
#[cfg(unix)]
async fn sync_dir(dir: &Path) {
    let result = match fs::File::open(dir).await {
        Ok(handle) => handle.sync_all().await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        warn!(dir = %dir.display(), error = %e, "failed to sync store directory");
    }
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) {}

#[async_trait]
impl KvStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.path_for(key)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(key, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Codec {
                key: key.to_string(),
                source,
            })
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let bytes = serde_json::to_vec_pretty(&value).map_err(|source| StoreError::Codec {
            key: key.to_string(),
            source,
        })?;

        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| io_error(key, e))?;
        let tmp = path.with_extension("json.tmp");
        write_synced(&tmp, &bytes)
            .await
            .map_err(|e| io_error(key, e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(key, e))?;
        sync_dir(&self.root).await;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(key, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state"));

        assert_eq!(store.get("backlog").await.unwrap(), None);

        store.set("backlog", json!([{"keyword": "rust"}])).await.unwrap();
        assert_eq!(
            store.get("backlog").await.unwrap(),
            Some(json!([{"keyword": "rust"}]))
        );
        assert!(!dir.path().join("state/backlog.json.tmp").exists());

        store.remove("backlog").await.unwrap();
        store.remove("backlog").await.unwrap();
        assert_eq!(store.get("backlog").await.unwrap(), None);
    }

    #[tokio::test]
    async fn values_survive_a_new_store_instance() {
        let dir = tempfile::tempdir().unwrap();
        JsonFileStore::new(dir.path())
            .set("scheduler_meta", json!({"paused": true}))
            .await
            .unwrap();

        let reopened = JsonFileStore::new(dir.path());
        let meta = reopened.get("scheduler_meta").await.unwrap().unwrap();
        assert_eq!(meta["paused"], json!(true));
    }

    #[tokio::test]
    async fn interrupted_write_leaves_the_previous_value_intact() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        store.set("backlog", json!(["first"])).await.unwrap();

        // a torn temp file from a write that never reached rename
        std::fs::write(dir.path().join("backlog.json.tmp"), b"[\"sec").unwrap();
        assert_eq!(store.get("backlog").await.unwrap(), Some(json!(["first"])));

        store.set("backlog", json!(["second"])).await.unwrap();
        let on_disk = std::fs::read(dir.path().join("backlog.json")).unwrap();
        let value: Value = serde_json::from_slice(&on_disk).unwrap();
        assert_eq!(value, json!(["second"]));
        assert!(!dir.path().join("backlog.json.tmp").exists());
    }

    #[tokio::test]
    async fn rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let err = store.set("../escape", json!(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn corrupt_file_is_a_codec_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("active_run.json"), b"{not json").unwrap();
        let store = JsonFileStore::new(dir.path());
        let err = store.get("active_run").await.unwrap_err();
        assert!(matches!(err, StoreError::Codec { .. }));
    }
}
