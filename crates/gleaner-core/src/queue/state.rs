//! Task status for the backlog.

use serde::{Deserialize, Serialize};

/// Task status.
///
/// State transitions:
/// - Pending -> Running -> Completed
/// - Pending -> Running -> Error (retry scheduled) -> Running -> ...
/// - Pending -> Running -> Error (retries exhausted, terminal)
/// - Pending -> Running -> Pending (explicit stop, or restart without an active Run)
/// - Completed -> Pending (recycle)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be selected.
    Pending,

    /// Has the single active Run.
    Running,

    /// Last Run finished successfully.
    Completed,

    /// Last Run failed; see `next_retry_at` / `retry_count`.
    Error,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
        }
    }
}
