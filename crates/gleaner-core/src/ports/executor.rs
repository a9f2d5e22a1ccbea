//! BrowsingExecutor port - ページ遷移と抽出を行う外部コラボレータ
//!
//! 実際のブラウザ操作・フィールド抽出はこの trait の向こう側にあり、
//! オーケストレーション側はページ単位の呼び出しと結果だけを扱います。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::{BlockReason, Category, ListedItem};

/// One search-result page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListPage {
    #[serde(default)]
    pub items: Vec<ListedItem>,

    /// Present when the marketplace shows a further page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

impl ListPage {
    pub fn has_next(&self) -> bool {
        self.next_page_token.is_some()
    }
}

/// Fields extracted from a detail page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    #[serde(default)]
    pub fields: Map<String, Value>,
}

/// What the browsing session currently shows; input of the health classifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_excerpt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error("page not found")]
    NotFound,

    #[error("challenge page shown")]
    Challenge,

    #[error("session expired")]
    SessionExpired,

    #[error("rate limited")]
    RateLimited,

    #[error("navigation timed out")]
    Timeout,

    #[error("navigation failed: {0}")]
    Navigation(String),
}

impl ExecutorError {
    /// The detection class this error carries, if any.
    pub fn block_reason(&self) -> Option<BlockReason> {
        match self {
            ExecutorError::Challenge => Some(BlockReason::Challenge),
            ExecutorError::SessionExpired => Some(BlockReason::SessionExpired),
            ExecutorError::RateLimited => Some(BlockReason::RateLimited),
            _ => None,
        }
    }
}

/// BrowsingExecutor はブラウジングセッションを 1 つ所有する
///
/// 呼び出しは常に 1 本ずつ（アクティブ Run の driver からのみ）行われる。
#[async_trait]
pub trait BrowsingExecutor: Send + Sync {
    /// `page_index` is 1-based.
    async fn list_page(
        &self,
        category: Category,
        keyword: &str,
        page_index: u32,
    ) -> Result<ListPage, ExecutorError>;

    async fn enrich(
        &self,
        category: Category,
        dedupe_key: &str,
        locator: &str,
    ) -> Result<Enrichment, ExecutorError>;

    async fn observe(&self) -> Result<Observation, ExecutorError>;
}
