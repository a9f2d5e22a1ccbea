//! FixtureExecutor - 記録済みページを再生する BrowsingExecutor
//!
//! オフライン実行用です。ディレクトリ構成:
//!
//! ```text
//! <root>/<category>/<keyword-slug>/page-<n>.json     ListPage
//! <root>/<category>/details/<key-slug>.json           Enrichment
//! ```
//!
//! 一覧ページが無ければ空ページ（次ページなし）、詳細が無ければ `NotFound`。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::Category;
use crate::ports::{BrowsingExecutor, Enrichment, ExecutorError, ListPage, Observation};

pub struct FixtureExecutor {
    root: PathBuf,
    last_url: Mutex<Option<String>>,
}

impl FixtureExecutor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            last_url: Mutex::new(None),
        }
    }

    pub fn list_path(&self, category: Category, keyword: &str, page_index: u32) -> PathBuf {
        self.root
            .join(category.as_str())
            .join(slug(keyword))
            .join(format!("page-{page_index}.json"))
    }

    pub fn detail_path(&self, category: Category, dedupe_key: &str) -> PathBuf {
        self.root
            .join(category.as_str())
            .join("details")
            .join(format!("{}.json", slug(dedupe_key)))
    }

    async fn visit(&self, path: &Path) {
        *self.last_url.lock().await = Some(format!("fixture://{}", path.display()));
    }
}

/// Lowercase ASCII alphanumerics; every other run of characters becomes one `-`.
pub fn slug(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut dash = false;
    for c in input.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !out.is_empty() {
            out.push('-');
            dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ExecutorError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ExecutorError::Navigation(format!("{}: {e}", path.display()))),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| ExecutorError::Navigation(format!("{}: {e}", path.display())))
}

#[async_trait]
impl BrowsingExecutor for FixtureExecutor {
    async fn list_page(
        &self,
        category: Category,
        keyword: &str,
        page_index: u32,
    ) -> Result<ListPage, ExecutorError> {
        let path = self.list_path(category, keyword, page_index);
        self.visit(&path).await;
        let page = read_json::<ListPage>(&path).await?.unwrap_or_default();
        debug!(path = %path.display(), items = page.items.len(), "fixture list page");
        Ok(page)
    }

    async fn enrich(
        &self,
        category: Category,
        dedupe_key: &str,
        _locator: &str,
    ) -> Result<Enrichment, ExecutorError> {
        let path = self.detail_path(category, dedupe_key);
        self.visit(&path).await;
        read_json::<Enrichment>(&path)
            .await?
            .ok_or(ExecutorError::NotFound)
    }

    async fn observe(&self) -> Result<Observation, ExecutorError> {
        Ok(Observation {
            url: self.last_url.lock().await.clone(),
            status_code: Some(200),
            title: None,
            body_excerpt: None,
        })
    }
}
