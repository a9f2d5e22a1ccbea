//! Status views returned by `getStatus`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{Category, Run, RunBlock, RunId, RunPhase, RunStatus, TaskId};
use crate::queue::{FailedTask, QueueSummary};

/// Snapshot of the active Run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveRunView {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub keyword: String,
    pub status: RunStatus,
    pub phase: RunPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block: Option<RunBlock>,
    pub pages_visited: u32,
    pub details_visited: u32,
    pub details_failed: u32,
    pub result_counts: BTreeMap<Category, usize>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Run> for ActiveRunView {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.run_id,
            task_id: run.task_id,
            keyword: run.keyword.clone(),
            status: run.status,
            phase: run.phase,
            category: run.current_category(),
            block: run.block.clone(),
            pages_visited: run.pages_visited,
            details_visited: run.details_visited,
            details_failed: run.details_failed,
            result_counts: run.result_counts(),
            started_at: run.started_at,
            updated_at: run.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub active_run: Option<ActiveRunView>,
    pub queue: QueueSummary,
    pub paused: bool,
    pub buffered_deliveries: usize,
    pub failed_tasks: Vec<FailedTask>,
    pub last_cycle_at: Option<DateTime<Utc>>,
}
