//! Task record: one keyword's crawl request and its bookkeeping.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskStatus;
use crate::domain::{Category, PriorityTier, RunId, TaskId};

/// Where a Task came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    #[default]
    Manual,
    Recommendation,
}

/// Per-enqueue options shared by every keyword of one `enqueue` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOptions {
    pub categories: Vec<Category>,
    /// 0 = unbounded.
    pub max_pages_per_category: u32,
    pub priority_tier: PriorityTier,
    /// 0..=100.
    pub estimated_value: f64,
    pub dependencies: Vec<TaskId>,
    /// Falls back to the retry policy's `max_retries`.
    pub max_retries: Option<u32>,
    pub source: TaskSource,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            categories: Category::ALL.to_vec(),
            max_pages_per_category: 10,
            priority_tier: PriorityTier::Normal,
            estimated_value: 50.0,
            dependencies: Vec::new(),
            max_retries: None,
            source: TaskSource::Manual,
        }
    }
}

/// Single source of truth for a Task's state; all transitions happen here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub keyword: String,
    pub categories: Vec<Category>,
    pub max_pages_per_category: u32,
    pub priority_tier: PriorityTier,
    pub estimated_value: f64,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,

    pub status: TaskStatus,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    pub added_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub result_counts: BTreeMap<Category, usize>,
    #[serde(default)]
    pub recycle_count: u32,
    #[serde(default)]
    pub source: TaskSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_id: Option<RunId>,
}

impl TaskRecord {
    /// `options.max_retries` must already be resolved by the caller.
    pub fn new(id: TaskId, keyword: impl Into<String>, options: &TaskOptions, now: DateTime<Utc>) -> Self {
        Self {
            id,
            keyword: keyword.into(),
            categories: options.categories.clone(),
            max_pages_per_category: options.max_pages_per_category,
            priority_tier: options.priority_tier,
            estimated_value: options.estimated_value,
            dependencies: options.dependencies.clone(),
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: options.max_retries.unwrap_or(3),
            next_retry_at: None,
            last_error: None,
            added_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            result_counts: BTreeMap::new(),
            recycle_count: 0,
            source: options.source,
            last_run_id: None,
        }
    }

    /// Mark as running under `run_id`.
    pub fn start(&mut self, run_id: RunId, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.next_retry_at = None;
        self.started_at = Some(now);
        self.last_run_id = Some(run_id);
        self.updated_at = now;
    }

    /// Fold a Run's per-category counts into the Task.
    pub fn fold_counts(&mut self, counts: BTreeMap<Category, usize>) {
        self.result_counts = counts;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.next_retry_at = None;
        self.last_error = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Count one more failure. Called before asking the Decider.
    pub fn register_failure(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.last_error = Some(error.into());
        self.updated_at = now;
    }

    /// Park in `error` until `next_retry_at`.
    pub fn schedule_retry(&mut self, next_retry_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = TaskStatus::Error;
        self.next_retry_at = Some(next_retry_at);
        self.updated_at = now;
    }

    /// Retries exhausted: stay in `error` with no retry time.
    pub fn give_up(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Error;
        self.next_retry_at = None;
        self.updated_at = now;
    }

    /// Back to `pending` without touching `retry_count` (explicit stop, restart).
    pub fn revert_to_pending(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.updated_at = now;
    }

    /// Put a completed Task back into rotation with a clean slate.
    pub fn recycle(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.retry_count = 0;
        self.next_retry_at = None;
        self.last_error = None;
        self.result_counts.clear();
        self.added_at = now;
        self.updated_at = now;
        self.recycle_count += 1;
    }

    pub fn retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// `error` with retries left and the backoff elapsed.
    pub fn is_retry_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Error
            && self.retries_left()
            && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// `error` for good.
    pub fn is_exhausted(&self) -> bool {
        self.status == TaskStatus::Error && !self.retries_left()
    }
}
