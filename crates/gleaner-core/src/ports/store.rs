//! KvStore port - 永続化ストア
//!
//! スケジューラの状態（backlog, active_run, delivery_buffer, scheduler_meta）を
//! JSON 値として key ごとに保存します。再起動時はここから復元します。
//!
//! # 実装
//! - `impls::MemoryStore`（テスト・一時実行用）
//! - `impls::JsonFileStore`（1 key = 1 ファイル、temp + rename で原子的に書き込み）

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// 保存キー
pub mod keys {
    pub const BACKLOG: &str = "backlog";
    pub const ACTIVE_RUN: &str = "active_run";
    pub const DELIVERY_BUFFER: &str = "delivery_buffer";
    pub const SCHEDULER_META: &str = "scheduler_meta";
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O failed for '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stored value for '{key}' is not valid: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid store key '{0}'")]
    InvalidKey(String),
}

/// KvStore は JSON 値の key-value ストア
///
/// 実装は `set` が完了した時点で値が耐久化されていることを保証する。
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// 型付きで読み出す
pub async fn load<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|source| StoreError::Codec {
                key: key.to_string(),
                source,
            }),
        None => Ok(None),
    }
}

/// 型付きで保存する
pub async fn save<T: Serialize + ?Sized>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let value = serde_json::to_value(value).map_err(|source| StoreError::Codec {
        key: key.to_string(),
        source,
    })?;
    store.set(key, value).await
}
