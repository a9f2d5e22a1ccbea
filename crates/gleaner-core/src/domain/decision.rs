//! Decision model: what to do with a Task whose Run failed.
//!
//! The Decider is pure: it reads the Task (with `retry_count` already
//! incremented for this failure) and returns the next action. Applying the
//! decision to the backlog is the Scheduler's job.

use std::time::Duration;

use crate::queue::{RetryPolicy, TaskRecord};

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Park the Task in `error` and retry after `delay`.
    Retry { delay: Duration, reason: String },

    /// Retries exhausted; the Task stays in `error` for good.
    GiveUp { reason: String },
}

pub trait Decider: Send + Sync {
    fn decide(&self, task: &TaskRecord, error: &str) -> Decision;
}

/// Retry-count based decider using the jittered exponential backoff of
/// [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

impl Default for DefaultDecider {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, task: &TaskRecord, error: &str) -> Decision {
        if task.retry_count >= task.max_retries {
            Decision::GiveUp {
                reason: format!(
                    "retries exhausted ({}/{}): {error}",
                    task.retry_count, task.max_retries
                ),
            }
        } else {
            let delay = self
                .retry_policy
                .backoff(task.retry_count, &mut rand::thread_rng());
            Decision::Retry {
                delay,
                reason: format!(
                    "retry {}/{} after {:?}: {error}",
                    task.retry_count, task.max_retries, delay
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Category, TaskId};
    use crate::queue::TaskOptions;
    use chrono::Utc;
    use ulid::Ulid;

    fn task(retry_count: u32) -> TaskRecord {
        let options = TaskOptions {
            categories: vec![Category::Jobs],
            ..TaskOptions::default()
        };
        let mut t = TaskRecord::new(TaskId::from_ulid(Ulid::new()), "x", &options, Utc::now());
        t.retry_count = retry_count;
        t
    }

    #[test]
    fn retries_within_backoff_bounds() {
        let decider = DefaultDecider::default();
        let Decision::Retry { delay, .. } = decider.decide(&task(1), "timeout") else {
            panic!("expected retry");
        };
        let (lo, hi) = decider.policy().delay_bounds(1);
        assert!(delay >= lo && delay <= hi, "{delay:?} not in {lo:?}..={hi:?}");
    }

    #[test]
    fn gives_up_at_max_retries() {
        let decider = DefaultDecider::default();
        let decision = decider.decide(&task(3), "timeout");
        assert!(matches!(decision, Decision::GiveUp { .. }));
    }
}
