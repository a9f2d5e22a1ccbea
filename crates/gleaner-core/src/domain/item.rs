//! Collected listings and their dedupe keys.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use url::Url;

use super::Category;

/// One listing as returned by the Browsing Executor on a search-result page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListedItem {
    /// Executor-provided stable key, if the page exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Where the detail page lives (usually a URL).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl ListedItem {
    pub fn new(locator: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            key: None,
            locator: Some(locator.into()),
            title: Some(title.into()),
            fields: Map::new(),
        }
    }

    /// Convert into a collected item, deriving the dedupe key.
    pub fn into_item(self, keyword: &str) -> Item {
        let dedupe_key = derive_dedupe_key(
            self.key.as_deref(),
            self.locator.as_deref(),
            self.title.as_deref().unwrap_or_default(),
            keyword,
        );
        Item {
            dedupe_key,
            locator: self.locator,
            title: self.title,
            fields: self.fields,
            detail_status: None,
            detail_error: None,
        }
    }
}

/// Result of the detail visit for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailStatus {
    Ok,
    Failed,
}

/// A listing collected during a Run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub dedupe_key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default)]
    pub fields: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail_status: Option<DetailStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail_error: Option<String>,
}

impl Item {
    /// Not yet visited and has somewhere to go.
    pub fn needs_enrichment(&self) -> bool {
        self.detail_status.is_none() && self.locator.is_some()
    }

    /// Merge a later sighting of the same listing (e.g. on an overlapping page).
    ///
    /// Detail results already recorded are kept.
    pub fn merge_listing(&mut self, other: Item) {
        if self.locator.is_none() {
            self.locator = other.locator;
        }
        if self.title.is_none() {
            self.title = other.title;
        }
        for (k, v) in other.fields {
            self.fields.insert(k, v);
        }
    }

    pub fn merge_enrichment(&mut self, fields: Map<String, Value>) {
        for (k, v) in fields {
            self.fields.insert(k, v);
        }
        self.detail_status = Some(DetailStatus::Ok);
        self.detail_error = None;
    }

    pub fn mark_detail_failed(&mut self, message: impl Into<String>) {
        // A later success wins over an earlier failure, never the reverse.
        if self.detail_status == Some(DetailStatus::Ok) {
            return;
        }
        self.detail_status = Some(DetailStatus::Failed);
        self.detail_error = Some(message.into());
    }
}

/// One pending detail visit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailQueueEntry {
    pub category: Category,
    pub dedupe_key: String,
    pub locator: String,
}

/// Derive a stable key for a listing.
///
/// Preference: executor key, then normalized locator, then a digest of
/// `title|keyword`.
pub fn derive_dedupe_key(
    key: Option<&str>,
    locator: Option<&str>,
    title: &str,
    keyword: &str,
) -> String {
    if let Some(key) = key.map(str::trim).filter(|k| !k.is_empty()) {
        return key.to_string();
    }
    if let Some(locator) = locator.map(str::trim).filter(|l| !l.is_empty()) {
        return normalize_locator(locator);
    }
    let digest = Sha256::digest(format!("{}|{}", title.trim(), keyword.trim()).as_bytes());
    let mut hexed = hex::encode(digest);
    hexed.truncate(20);
    format!("h_{hexed}")
}

/// Drop query, fragment and trailing slash.
///
/// Absolute locators go through `Url`, which lowercases scheme and host and
/// elides default ports; the path keeps its case.
fn normalize_locator(locator: &str) -> String {
    match Url::parse(locator) {
        Ok(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            url.as_str().trim_end_matches('/').to_string()
        }
        // relative locator
        Err(_) => locator
            .split(['?', '#'])
            .next()
            .unwrap_or(locator)
            .trim_end_matches('/')
            .to_string(),
    }
}
