//! Queue: Task records, selection, retry policy and dependencies.

pub mod backlog;
pub mod dependency;
pub mod priority;
pub mod record;
pub mod retry;
pub mod state;

pub use backlog::{Backlog, EnqueueReport, FailedTask, QueueSummary};
pub use dependency::DependencyGraph;
pub use priority::selection_score;
pub use record::{TaskOptions, TaskRecord, TaskSource};
pub use retry::RetryPolicy;
pub use state::TaskStatus;
