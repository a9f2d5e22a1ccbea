//! Run: the live state machine of one Task.
//!
//! Phase transitions only move forward:
//! `list(c0, 1..)` -> `detail(c0, 0..)` -> `list(c1, 1..)` -> ... -> `terminal`.
//!
//! Everything here is pure state; navigation happens in `run::machine`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::item::{DetailQueueEntry, DetailStatus, Item, ListedItem};
use super::{Category, RunId, TaskId};

/// Where the Run is within the current category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RunPhase {
    /// Next page to request (1-based).
    List { page_index: u32 },
    /// Next entry of `detail_queue` to visit.
    Detail { detail_index: usize },
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Blocked,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Stopped
        )
    }
}

/// Detection events that stop a Run from advancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlockReason {
    Challenge,
    SessionExpired,
    RateLimited,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BlockReason::Challenge => "challenge",
            BlockReason::SessionExpired => "sessionExpired",
            BlockReason::RateLimited => "rateLimited",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunBlock {
    pub reason: BlockReason,
    pub since: DateTime<Utc>,
    /// Unconditional resume time (rate limiting only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub keyword: String,
    pub categories: Vec<Category>,
    /// 0 = unbounded.
    pub max_pages_per_category: u32,

    pub category_index: usize,
    pub phase: RunPhase,
    #[serde(default)]
    pub detail_queue: Vec<DetailQueueEntry>,

    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<RunBlock>,

    #[serde(default)]
    pub items: BTreeMap<Category, Vec<Item>>,

    #[serde(default)]
    pub pages_visited: u32,
    #[serde(default)]
    pub details_visited: u32,
    #[serde(default)]
    pub details_failed: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(
        run_id: RunId,
        task_id: TaskId,
        keyword: impl Into<String>,
        categories: Vec<Category>,
        max_pages_per_category: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let mut run = Self {
            run_id,
            task_id,
            keyword: keyword.into(),
            categories,
            max_pages_per_category,
            category_index: 0,
            phase: RunPhase::List { page_index: 1 },
            detail_queue: Vec::new(),
            status: RunStatus::Running,
            block: None,
            items: BTreeMap::new(),
            pages_visited: 0,
            details_visited: 0,
            details_failed: 0,
            last_error: None,
            started_at: now,
            updated_at: now,
            finished_at: None,
        };
        if run.categories.is_empty() {
            run.complete(now);
        }
        run
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn current_category(&self) -> Option<Category> {
        match self.phase {
            RunPhase::Terminal => None,
            _ => self.categories.get(self.category_index).copied(),
        }
    }

    pub fn current_detail_entry(&self) -> Option<&DetailQueueEntry> {
        match self.phase {
            RunPhase::Detail { detail_index } => self.detail_queue.get(detail_index),
            _ => None,
        }
    }

    /// Record one search-result page and move to the next page or the detail phase.
    pub fn record_list_page(&mut self, listed: Vec<ListedItem>, has_next: bool, now: DateTime<Utc>) {
        let RunPhase::List { page_index } = self.phase else {
            return;
        };
        let Some(category) = self.current_category() else {
            return;
        };

        let items: Vec<Item> = listed
            .into_iter()
            .map(|l| l.into_item(&self.keyword))
            .collect();
        self.merge_items(category, items);
        self.pages_visited += 1;
        self.updated_at = now;

        let within_budget =
            self.max_pages_per_category == 0 || page_index < self.max_pages_per_category;
        if has_next && within_budget {
            self.phase = RunPhase::List {
                page_index: page_index + 1,
            };
        } else {
            self.enter_detail(now);
        }
    }

    /// Merge listings into a category, de-duplicating by key.
    pub fn merge_items(&mut self, category: Category, items: Vec<Item>) {
        let bucket = self.items.entry(category).or_default();
        for item in items {
            match bucket.iter_mut().find(|i| i.dedupe_key == item.dedupe_key) {
                Some(existing) => existing.merge_listing(item),
                None => bucket.push(item),
            }
        }
    }

    /// Build the detail queue for the current category; skip ahead if empty.
    fn enter_detail(&mut self, now: DateTime<Utc>) {
        let Some(category) = self.current_category() else {
            return;
        };
        let mut seen = std::collections::HashSet::new();
        self.detail_queue = self
            .items
            .get(&category)
            .into_iter()
            .flatten()
            .filter(|item| item.needs_enrichment())
            .filter(|item| seen.insert(item.dedupe_key.clone()))
            .filter_map(|item| {
                item.locator.clone().map(|locator| DetailQueueEntry {
                    category,
                    dedupe_key: item.dedupe_key.clone(),
                    locator,
                })
            })
            .collect();

        if self.detail_queue.is_empty() {
            self.advance_category(now);
        } else {
            self.phase = RunPhase::Detail { detail_index: 0 };
            self.updated_at = now;
        }
    }

    /// Merge enrichment fields into the item with `dedupe_key`.
    ///
    /// Returns false when no such item exists.
    pub fn merge_enrichment(
        &mut self,
        category: Category,
        dedupe_key: &str,
        fields: Map<String, Value>,
    ) -> bool {
        match self.find_item_mut(category, dedupe_key) {
            Some(item) => {
                item.merge_enrichment(fields);
                true
            }
            None => false,
        }
    }

    /// Record a successful visit of the current detail entry and advance.
    pub fn record_detail_success(&mut self, fields: Map<String, Value>, now: DateTime<Utc>) {
        let Some(entry) = self.current_detail_entry().cloned() else {
            return;
        };
        self.merge_enrichment(entry.category, &entry.dedupe_key, fields);
        self.details_visited += 1;
        self.advance_detail(now);
    }

    /// Record a failed visit of the current detail entry and advance anyway.
    pub fn record_detail_failure(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        let Some(entry) = self.current_detail_entry().cloned() else {
            return;
        };
        let message = message.into();
        if let Some(item) = self.find_item_mut(entry.category, &entry.dedupe_key) {
            item.mark_detail_failed(message);
        }
        self.details_visited += 1;
        self.details_failed += 1;
        self.advance_detail(now);
    }

    fn advance_detail(&mut self, now: DateTime<Utc>) {
        let RunPhase::Detail { detail_index } = self.phase else {
            return;
        };
        let next = detail_index + 1;
        if next < self.detail_queue.len() {
            self.phase = RunPhase::Detail { detail_index: next };
            self.updated_at = now;
        } else {
            self.advance_category(now);
        }
    }

    fn advance_category(&mut self, now: DateTime<Utc>) {
        self.detail_queue.clear();
        self.category_index += 1;
        if self.category_index < self.categories.len() {
            self.phase = RunPhase::List { page_index: 1 };
            self.updated_at = now;
        } else {
            self.complete(now);
        }
    }

    fn find_item_mut(&mut self, category: Category, dedupe_key: &str) -> Option<&mut Item> {
        self.items
            .get_mut(&category)?
            .iter_mut()
            .find(|i| i.dedupe_key == dedupe_key)
    }

    pub fn block(
        &mut self,
        reason: BlockReason,
        resume_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        if self.is_terminal() {
            return;
        }
        self.status = RunStatus::Blocked;
        self.block = Some(RunBlock {
            reason,
            since: now,
            resume_at,
        });
        self.updated_at = now;
    }

    pub fn unblock(&mut self, now: DateTime<Utc>) {
        if self.status != RunStatus::Blocked {
            return;
        }
        self.status = RunStatus::Running;
        self.block = None;
        self.updated_at = now;
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.finish(RunStatus::Completed, None, now);
    }

    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.finish(RunStatus::Failed, Some(message.into()), now);
    }

    pub fn stop(&mut self, now: DateTime<Utc>) {
        self.finish(RunStatus::Stopped, None, now);
    }

    fn finish(&mut self, status: RunStatus, error: Option<String>, now: DateTime<Utc>) {
        if self.is_terminal() {
            return;
        }
        if error.is_some() {
            self.last_error = error;
        }
        self.status = status;
        self.phase = RunPhase::Terminal;
        self.block = None;
        self.detail_queue.clear();
        self.updated_at = now;
        self.finished_at = Some(now);
    }

    /// Collected item count per category.
    pub fn result_counts(&self) -> BTreeMap<Category, usize> {
        self.items
            .iter()
            .map(|(category, items)| (*category, items.len()))
            .collect()
    }

    pub fn enriched_count(&self) -> usize {
        self.items
            .values()
            .flatten()
            .filter(|i| i.detail_status == Some(DetailStatus::Ok))
            .count()
    }
}
