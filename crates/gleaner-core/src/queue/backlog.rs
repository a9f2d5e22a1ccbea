//! Backlog: the persisted list of Tasks and the selection rules over it.
//!
//! Pure state. The Scheduler owns one behind its mutex and persists it
//! after every mutation.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::dependency::DependencyGraph;
use super::priority::pick_best;
use super::{TaskOptions, TaskRecord, TaskStatus};
use crate::domain::{GleanerError, TaskId};
use crate::ports::IdGenerator;

/// Result of one `enqueue` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnqueueReport {
    pub added: Vec<TaskId>,
    /// Keywords already present (case-insensitive), in input order.
    pub skipped: Vec<String>,
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub error: usize,
}

/// A Task in `error`, as surfaced by status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTask {
    pub id: TaskId,
    pub keyword: String,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Backlog {
    tasks: Vec<TaskRecord>,
}

impl Backlog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[TaskRecord] {
        &self.tasks
    }

    pub fn get(&self, id: TaskId) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut TaskRecord> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Validate and append Tasks for `keywords`.
    ///
    /// The whole call is rejected on any contract violation; nothing is added.
    pub fn enqueue(
        &mut self,
        keywords: &[String],
        options: &TaskOptions,
        default_max_retries: u32,
        ids: &dyn IdGenerator,
        now: DateTime<Utc>,
    ) -> Result<EnqueueReport, GleanerError> {
        if keywords.is_empty() {
            return Err(GleanerError::NoKeywords);
        }
        let trimmed: Vec<&str> = keywords.iter().map(|k| k.trim()).collect();
        if let Some(index) = trimmed.iter().position(|k| k.is_empty()) {
            return Err(GleanerError::BlankKeyword { index });
        }
        if options.categories.is_empty() {
            return Err(GleanerError::EmptyCategories);
        }
        let value = options.estimated_value;
        if !(0.0..=100.0).contains(&value) {
            return Err(GleanerError::EstimatedValueOutOfRange(value));
        }
        if let Some(unknown) = options
            .dependencies
            .iter()
            .find(|dep| self.get(**dep).is_none())
        {
            return Err(GleanerError::UnknownDependency(*unknown));
        }

        let mut options = options.clone();
        let mut seen_categories = HashSet::new();
        options.categories.retain(|c| seen_categories.insert(*c));
        options.max_retries = Some(options.max_retries.unwrap_or(default_max_retries));

        let mut seen: HashSet<String> = self
            .tasks
            .iter()
            .map(|t| t.keyword.to_lowercase())
            .collect();
        let mut report = EnqueueReport::default();
        let mut fresh = Vec::new();
        for keyword in trimmed {
            if !seen.insert(keyword.to_lowercase()) {
                report.skipped.push(keyword.to_string());
                continue;
            }
            let record = TaskRecord::new(ids.generate_task_id(), keyword, &options, now);
            report.added.push(record.id);
            fresh.push(record);
        }

        let graph = DependencyGraph::from_records(self.tasks.iter().chain(fresh.iter()));
        if let Some(cycle) = graph.detect_cycle() {
            return Err(GleanerError::DependencyCycle(cycle));
        }

        self.tasks.extend(fresh);
        Ok(report)
    }

    /// Every dependency exists and is `completed`.
    pub fn dependencies_satisfied(&self, task: &TaskRecord) -> bool {
        task.dependencies.iter().all(|dep| {
            self.get(*dep)
                .is_some_and(|d| d.status == TaskStatus::Completed)
        })
    }

    /// Best `pending` Task with satisfied dependencies and no future retry time.
    pub fn select_pending(&self, now: DateTime<Utc>) -> Option<TaskId> {
        let candidates = self.tasks.iter().filter(|t| {
            t.status == TaskStatus::Pending
                && t.next_retry_at.is_none_or(|at| at <= now)
                && self.dependencies_satisfied(t)
        });
        pick_best(candidates, now).map(|t| t.id)
    }

    /// Best `error` Task whose backoff has elapsed.
    pub fn select_retry(&self, now: DateTime<Utc>) -> Option<TaskId> {
        let candidates = self
            .tasks
            .iter()
            .filter(|t| t.is_retry_due(now) && self.dependencies_satisfied(t));
        pick_best(candidates, now).map(|t| t.id)
    }

    /// Move up to `batch` of the oldest-completed Tasks back to `pending`.
    pub fn recycle_oldest_completed(&mut self, batch: usize, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut completed: Vec<(DateTime<Utc>, TaskId)> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| (t.completed_at.unwrap_or(t.updated_at), t.id))
            .collect();
        completed.sort();
        completed.truncate(batch);

        let ids: Vec<TaskId> = completed.into_iter().map(|(_, id)| id).collect();
        for id in &ids {
            if let Some(task) = self.get_mut(*id) {
                task.recycle(now);
            }
        }
        ids
    }

    /// Reset `running` Tasks other than `keep` to `pending`.
    ///
    /// Used on restore: a Task can only be running while it owns the active Run.
    pub fn reset_orphaned_running(&mut self, keep: Option<TaskId>, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut reset = Vec::new();
        for task in &mut self.tasks {
            if task.status == TaskStatus::Running && Some(task.id) != keep {
                task.revert_to_pending(now);
                reset.push(task.id);
            }
        }
        reset
    }

    pub fn summary(&self) -> QueueSummary {
        let mut summary = QueueSummary {
            total: self.tasks.len(),
            ..QueueSummary::default()
        };
        for task in &self.tasks {
            match task.status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::Running => summary.running += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Error => summary.error += 1,
            }
        }
        summary
    }

    pub fn failed_tasks(&self) -> Vec<FailedTask> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Error)
            .map(|t| FailedTask {
                id: t.id,
                keyword: t.keyword.clone(),
                retry_count: t.retry_count,
                last_error: t.last_error.clone(),
                next_retry_at: t.next_retry_at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Category, PriorityTier, RunId};
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::{Duration, TimeZone};
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
    }

    fn ids() -> UlidGenerator<FixedClock> {
        UlidGenerator::new(FixedClock::new(t0()))
    }

    fn kws(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn enqueue(backlog: &mut Backlog, list: &[&str], options: &TaskOptions) -> EnqueueReport {
        backlog.enqueue(&kws(list), options, 3, &ids(), t0()).unwrap()
    }

    #[test]
    fn keywords_are_trimmed_and_deduped_case_insensitively() {
        let mut backlog = Backlog::new();
        let report = enqueue(&mut backlog, &[" Rust ", "rust", "go"], &TaskOptions::default());
        assert_eq!(report.added.len(), 2);
        assert_eq!(report.skipped, vec!["rust".to_string()]);

        let again = enqueue(&mut backlog, &["GO"], &TaskOptions::default());
        assert!(again.added.is_empty());
        assert_eq!(backlog.get(report.added[0]).unwrap().keyword, "Rust");
    }

    #[test]
    fn invalid_calls_are_rejected_whole() {
        let mut backlog = Backlog::new();
        let err = backlog
            .enqueue(&kws(&["ok", "  "]), &TaskOptions::default(), 3, &ids(), t0())
            .unwrap_err();
        assert!(matches!(err, GleanerError::BlankKeyword { index: 1 }));
        assert!(backlog.is_empty());

        let no_categories = TaskOptions {
            categories: vec![],
            ..TaskOptions::default()
        };
        assert!(matches!(
            backlog.enqueue(&kws(&["ok"]), &no_categories, 3, &ids(), t0()),
            Err(GleanerError::EmptyCategories)
        ));

        let too_valuable = TaskOptions {
            estimated_value: 101.0,
            ..TaskOptions::default()
        };
        assert!(matches!(
            backlog.enqueue(&kws(&["ok"]), &too_valuable, 3, &ids(), t0()),
            Err(GleanerError::EstimatedValueOutOfRange(_))
        ));

        let ghost = TaskOptions {
            dependencies: vec![TaskId::from_ulid(Ulid::new())],
            ..TaskOptions::default()
        };
        assert!(matches!(
            backlog.enqueue(&kws(&["ok"]), &ghost, 3, &ids(), t0()),
            Err(GleanerError::UnknownDependency(_))
        ));
        assert!(matches!(
            backlog.enqueue(&[], &TaskOptions::default(), 3, &ids(), t0()),
            Err(GleanerError::NoKeywords)
        ));
        assert!(backlog.is_empty());
    }

    #[test]
    fn unsatisfied_dependency_is_never_selected() {
        let mut backlog = Backlog::new();
        let base = enqueue(&mut backlog, &["base"], &TaskOptions::default()).added[0];
        let dependent_opts = TaskOptions {
            priority_tier: PriorityTier::Critical,
            dependencies: vec![base],
            ..TaskOptions::default()
        };
        let dependent = enqueue(&mut backlog, &["dependent"], &dependent_opts).added[0];

        assert_eq!(backlog.select_pending(t0()), Some(base));

        let run = RunId::from_ulid(Ulid::new());
        backlog.get_mut(base).unwrap().start(run, t0());
        assert_eq!(backlog.select_pending(t0()), None);

        backlog.get_mut(base).unwrap().mark_completed(t0());
        assert_eq!(backlog.select_pending(t0()), Some(dependent));
    }

    #[test]
    fn higher_tier_wins_selection() {
        let mut backlog = Backlog::new();
        enqueue(&mut backlog, &["low"], &TaskOptions {
            priority_tier: PriorityTier::Low,
            ..TaskOptions::default()
        });
        let high = enqueue(&mut backlog, &["high"], &TaskOptions {
            priority_tier: PriorityTier::High,
            ..TaskOptions::default()
        })
        .added[0];
        assert_eq!(backlog.select_pending(t0()), Some(high));
    }

    #[test]
    fn retry_path_waits_for_backoff() {
        let mut backlog = Backlog::new();
        let id = enqueue(&mut backlog, &["x"], &TaskOptions::default()).added[0];
        let task = backlog.get_mut(id).unwrap();
        task.start(RunId::from_ulid(Ulid::new()), t0());
        task.register_failure("timeout", t0());
        task.schedule_retry(t0() + Duration::seconds(60), t0());

        assert_eq!(backlog.select_pending(t0()), None);
        assert_eq!(backlog.select_retry(t0()), None);
        assert_eq!(backlog.select_retry(t0() + Duration::seconds(61)), Some(id));
    }

    #[test]
    fn recycles_oldest_completed_first() {
        let mut backlog = Backlog::new();
        let report = enqueue(&mut backlog, &["a", "b", "c"], &TaskOptions::default());
        for (i, id) in report.added.iter().enumerate() {
            backlog
                .get_mut(*id)
                .unwrap()
                .mark_completed(t0() + Duration::minutes(10 - i as i64));
        }

        let recycled = backlog.recycle_oldest_completed(2, t0() + Duration::hours(1));
        assert_eq!(recycled, vec![report.added[2], report.added[1]]);
        assert_eq!(backlog.summary().pending, 2);
        assert_eq!(backlog.summary().completed, 1);
    }

    #[test]
    fn duplicate_categories_collapse() {
        let mut backlog = Backlog::new();
        let options = TaskOptions {
            categories: vec![Category::Talent, Category::Jobs, Category::Talent],
            ..TaskOptions::default()
        };
        let id = enqueue(&mut backlog, &["x"], &options).added[0];
        assert_eq!(
            backlog.get(id).unwrap().categories,
            vec![Category::Talent, Category::Jobs]
        );
    }
}
