//! Scheduler - キュー管理とアクティブ Run のライフサイクル
//!
//! # 責務
//! - `enqueue`: 入力検証 + backlog への追加
//! - `tick`: 配送バッファの flush → 終了 Run の確定 → driver の再接続 → 次 Task の選択と開始
//! - `pause` / `resume` / `stop` / `status`
//! - `restore`: 再起動時にストアから状態を復元
//!
//! # 並行性
//! - 共有状態（backlog, active Run, meta）は 1 つの `tokio::sync::Mutex` の中
//! - 状態を変えた操作はロックを持ったまま永続化する
//! - `tick` は tick guard で直列化（2 つの tick が交差しない）。`stop` / `pause` は
//!   guard を取らないので、Sink 待ちの tick の後ろで待たされない
//! - アクティブ Run は同時に 1 本だけ（single-flight）
//! - 終了した Run は Delivery Buffer に永続化してから `active_run` を消す

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::runner::{RunControl, RunnerDeps, RunnerHandle};
use super::status::{ActiveRunView, SchedulerStatus};
use crate::delivery::{DeliveryBuffer, FlushReport, TelemetryDebouncer};
use crate::domain::{Decider, Decision, GleanerError, Run, RunId, RunStatus, TaskId};
use crate::monitor::{HealthMarkers, Throttle};
use crate::ports::store::{self, keys};
use crate::ports::{
    BrowsingExecutor, Clock, DeliverySink, IdGenerator, KvStore, QueueTelemetry, SinkError,
    StoreError,
};
use crate::queue::{Backlog, EnqueueReport, TaskOptions, TaskRecord, TaskSource, TaskStatus};

/// Scheduler のチューニング値
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    /// Delivery Buffer entries retried per tick.
    pub flush_batch: usize,
    pub recommendation_cooldown: Duration,
    pub recommendation_limit: usize,
    pub recycle_batch_size: usize,
    pub navigation_timeout: Duration,
    pub challenge_poll_interval: Duration,
    pub rate_limit_cooldown: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(3),
            flush_batch: 20,
            recommendation_cooldown: Duration::from_secs(15),
            recommendation_limit: 10,
            recycle_batch_size: 5,
            navigation_timeout: Duration::from_secs(45),
            challenge_poll_interval: Duration::from_secs(30),
            rate_limit_cooldown: Duration::from_secs(300),
        }
    }
}

/// `scheduler_meta` に保存される値
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerMeta {
    #[serde(default)]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_recommendation_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cycle_at: Option<DateTime<Utc>>,
}

pub(crate) struct SchedulerState {
    pub backlog: Backlog,
    pub active_run: Option<Run>,
    pub meta: SchedulerMeta,
    pub throttle: Throttle,
    pub driver: Option<RunnerHandle>,
}

/// What one tick did after flushing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TickAction {
    /// A terminal Run was folded into its Task and handed to delivery.
    Finalized {
        task_id: TaskId,
        run_id: RunId,
        task_status: Option<TaskStatus>,
    },
    /// A non-terminal Run without a live driver got a new one.
    Resumed { run_id: RunId },
    Started { task_id: TaskId, run_id: RunId },
    /// The active Run's driver is still working.
    Driving { run_id: RunId },
    Paused,
    Idle,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub flush: FlushReport,
    pub action: TickAction,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RestoreReport {
    pub tasks: usize,
    /// `running` Tasks without an active Run, moved back to `pending`.
    pub reset_to_pending: Vec<TaskId>,
    pub active_run: Option<RunId>,
    pub buffered_deliveries: usize,
}

/// Everything the builder wires into a Scheduler.
pub(crate) struct SchedulerParts {
    pub store: Arc<dyn KvStore>,
    pub executor: Arc<dyn BrowsingExecutor>,
    pub sink: Arc<dyn DeliverySink>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub decider: Arc<dyn Decider>,
    pub delivery: DeliveryBuffer,
    pub telemetry: TelemetryDebouncer,
    pub throttle: Throttle,
    pub markers: HealthMarkers,
    pub settings: SchedulerSettings,
    pub default_max_retries: u32,
    pub sink_timeout: Duration,
}

struct Inner {
    state: Arc<Mutex<SchedulerState>>,
    tick_guard: Mutex<()>,
    store: Arc<dyn KvStore>,
    executor: Arc<dyn BrowsingExecutor>,
    sink: Arc<dyn DeliverySink>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    decider: Arc<dyn Decider>,
    delivery: DeliveryBuffer,
    telemetry: TelemetryDebouncer,
    markers: HealthMarkers,
    settings: SchedulerSettings,
    default_max_retries: u32,
    sink_timeout: Duration,
}

/// Cheap to clone; clones share one backlog and one active Run.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub(crate) fn from_parts(parts: SchedulerParts) -> Self {
        let state = SchedulerState {
            backlog: Backlog::new(),
            active_run: None,
            meta: SchedulerMeta::default(),
            throttle: parts.throttle,
            driver: None,
        };
        Self {
            inner: Arc::new(Inner {
                state: Arc::new(Mutex::new(state)),
                tick_guard: Mutex::new(()),
                store: parts.store,
                executor: parts.executor,
                sink: parts.sink,
                clock: parts.clock,
                ids: parts.ids,
                decider: parts.decider,
                delivery: parts.delivery,
                telemetry: parts.telemetry,
                markers: parts.markers,
                settings: parts.settings,
                default_max_retries: parts.default_max_retries,
                sink_timeout: parts.sink_timeout,
            }),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    /// Reload backlog, active Run, meta and the delivery buffer from the store.
    pub async fn restore(&self) -> Result<RestoreReport, GleanerError> {
        let now = self.inner.clock.now();
        let store = self.inner.store.as_ref();

        let mut backlog: Backlog = store::load(store, keys::BACKLOG).await?.unwrap_or_default();
        let mut active_run: Option<Run> = store::load(store, keys::ACTIVE_RUN).await?;
        let meta: SchedulerMeta = store::load(store, keys::SCHEDULER_META)
            .await?
            .unwrap_or_default();

        let orphan = active_run
            .as_ref()
            .filter(|run| backlog.get(run.task_id).is_none())
            .map(|run| (run.run_id, run.task_id));
        if let Some((run_id, task_id)) = orphan {
            warn!(run_id = %run_id, task_id = %task_id, "stored active run has no task; discarding");
            active_run = None;
            store.remove(keys::ACTIVE_RUN).await?;
        }

        let keep = active_run.as_ref().map(|r| r.task_id);
        let reset = backlog.reset_orphaned_running(keep, now);
        if !reset.is_empty() {
            warn!(count = reset.len(), "orphaned running tasks reset to pending");
            store::save(store, keys::BACKLOG, &backlog).await?;
        }

        let report_active = active_run.as_ref().map(|r| r.run_id);
        let tasks = backlog.len();
        {
            let mut state = self.inner.state.lock().await;
            state.backlog = backlog;
            state.active_run = active_run;
            state.meta = meta;
        }
        let buffered = self.inner.delivery.restore().await?;

        info!(
            tasks,
            active_run = ?report_active,
            buffered_deliveries = buffered,
            "scheduler state restored"
        );
        Ok(RestoreReport {
            tasks,
            reset_to_pending: reset,
            active_run: report_active,
            buffered_deliveries: buffered,
        })
    }

    pub async fn enqueue(
        &self,
        keywords: &[String],
        options: &TaskOptions,
    ) -> Result<EnqueueReport, GleanerError> {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock().await;
        let report = state.backlog.enqueue(
            keywords,
            options,
            self.inner.default_max_retries,
            self.inner.ids.as_ref(),
            now,
        )?;
        if !report.added.is_empty() {
            self.persist_backlog(&state.backlog).await?;
        }
        info!(
            added = report.added.len(),
            skipped = report.skipped.len(),
            "keywords enqueued"
        );
        Ok(report)
    }

    /// One scheduling cycle.
    pub async fn tick(&self) -> Result<TickReport, GleanerError> {
        let _tick = self.inner.tick_guard.lock().await;

        let flush = self.inner.delivery.flush(self.inner.settings.flush_batch).await;
        if flush.attempted > 0 {
            debug!(
                delivered = flush.delivered,
                remaining = flush.remaining,
                "delivery buffer flushed"
            );
        }

        let action = self.advance().await?;

        let telemetry = {
            let mut state = self.inner.state.lock().await;
            state.meta.last_cycle_at = Some(self.inner.clock.now());
            self.persist_meta(&state.meta).await?;
            telemetry_of(&state)
        };
        self.inner.telemetry.notify(&telemetry, false).await;

        Ok(TickReport { flush, action })
    }

    async fn advance(&self) -> Result<TickAction, GleanerError> {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock().await;

        match state.active_run.as_ref().map(|r| (r.run_id, r.is_terminal())) {
            Some((_, true)) => {
                let Some(run) = state.active_run.clone() else {
                    return Ok(TickAction::Idle);
                };
                let task_status = self.finalize_locked(&mut state, &run, now).await?;
                let telemetry = telemetry_of(&state);
                drop(state);
                self.deliver(&run, &telemetry).await;
                return Ok(TickAction::Finalized {
                    task_id: run.task_id,
                    run_id: run.run_id,
                    task_status,
                });
            }
            Some((run_id, false)) => {
                if state.driver.as_ref().is_some_and(|d| !d.is_finished()) {
                    return Ok(TickAction::Driving { run_id });
                }
                if state.meta.paused {
                    return Ok(TickAction::Paused);
                }
                let Some(run) = state.active_run.clone() else {
                    return Ok(TickAction::Idle);
                };
                info!(run_id = %run_id, task_id = %run.task_id, "re-attaching run driver");
                state.driver = Some(RunnerHandle::spawn(self.runner_deps(), run));
                return Ok(TickAction::Resumed { run_id });
            }
            None => {}
        }

        if state.meta.paused {
            return Ok(TickAction::Paused);
        }
        drop(state);

        let Some(task_id) = self.select_next(now).await? else {
            return Ok(TickAction::Idle);
        };

        let mut state = self.inner.state.lock().await;
        if state.meta.paused {
            return Ok(TickAction::Paused);
        }
        if state.active_run.is_some() {
            return Ok(TickAction::Idle);
        }
        self.start_locked(&mut state, task_id, now).await
    }

    /// pending → retry → recommendations → recycle.
    async fn select_next(&self, now: DateTime<Utc>) -> Result<Option<TaskId>, GleanerError> {
        {
            let state = self.inner.state.lock().await;
            if let Some(id) = select_ready(&state.backlog, now) {
                return Ok(Some(id));
            }
        }

        if self.pull_recommendations(now).await? {
            let state = self.inner.state.lock().await;
            if let Some(id) = select_ready(&state.backlog, now) {
                return Ok(Some(id));
            }
        }

        let mut state = self.inner.state.lock().await;
        let recycled = state
            .backlog
            .recycle_oldest_completed(self.inner.settings.recycle_batch_size, now);
        if recycled.is_empty() {
            return Ok(None);
        }
        info!(count = recycled.len(), "completed tasks recycled");
        self.persist_backlog(&state.backlog).await?;
        Ok(state.backlog.select_pending(now))
    }

    /// Returns true when new Tasks were added.
    async fn pull_recommendations(&self, now: DateTime<Utc>) -> Result<bool, GleanerError> {
        {
            let mut state = self.inner.state.lock().await;
            let cooldown = self.inner.settings.recommendation_cooldown;
            let due = state
                .meta
                .last_recommendation_at
                .is_none_or(|at| (now - at).to_std().unwrap_or(Duration::ZERO) >= cooldown);
            if !due {
                return Ok(false);
            }
            state.meta.last_recommendation_at = Some(now);
            self.persist_meta(&state.meta).await?;
        }

        let limit = self.inner.settings.recommendation_limit;
        let result = match tokio::time::timeout(
            self.inner.sink_timeout,
            self.inner.sink.recommended_keywords(limit),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout),
        };
        let recommendations = match result {
            Ok(recommendations) => recommendations,
            Err(e) => {
                warn!(error = %e, "recommendation pull failed");
                return Ok(false);
            }
        };
        if recommendations.is_empty() {
            return Ok(false);
        }

        let mut state = self.inner.state.lock().await;
        let mut added = 0;
        for rec in &recommendations {
            let options = TaskOptions {
                priority_tier: rec.recommended_priority,
                estimated_value: rec.estimated_value(),
                source: TaskSource::Recommendation,
                ..TaskOptions::default()
            };
            match state.backlog.enqueue(
                std::slice::from_ref(&rec.keyword),
                &options,
                self.inner.default_max_retries,
                self.inner.ids.as_ref(),
                now,
            ) {
                Ok(report) => added += report.added.len(),
                Err(e) => warn!(keyword = %rec.keyword, error = %e, "recommendation rejected"),
            }
        }
        if added > 0 {
            self.persist_backlog(&state.backlog).await?;
            info!(added, "recommended keywords enqueued");
        }
        Ok(added > 0)
    }

    async fn start_locked(
        &self,
        state: &mut SchedulerState,
        task_id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<TickAction, GleanerError> {
        let run_id = self.inner.ids.generate_run_id();
        let Some(task) = state.backlog.get_mut(task_id) else {
            return Err(GleanerError::UnknownTask(task_id));
        };
        task.start(run_id, now);
        let run = Run::new(
            run_id,
            task.id,
            task.keyword.clone(),
            task.categories.clone(),
            task.max_pages_per_category,
            now,
        );
        info!(
            task_id = %task_id,
            run_id = %run_id,
            keyword = %run.keyword,
            retry_count = task.retry_count,
            "run started"
        );

        self.persist_backlog(&state.backlog).await?;
        store::save(self.inner.store.as_ref(), keys::ACTIVE_RUN, &run).await?;
        state.active_run = Some(run.clone());
        state.driver = Some(RunnerHandle::spawn(self.runner_deps(), run));
        Ok(TickAction::Started { task_id, run_id })
    }

    /// Fold a terminal (or stopped) Run into its Task and clear `active_run`.
    ///
    /// Nothing changes unless the Run is first staged in the Delivery Buffer.
    async fn finalize_locked(
        &self,
        state: &mut SchedulerState,
        run: &Run,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskStatus>, GleanerError> {
        self.inner.delivery.stage(run).await?;
        state.active_run = None;
        state.driver = None;

        let task_status = match state.backlog.get_mut(run.task_id) {
            Some(task) => {
                match run.status {
                    RunStatus::Completed => {
                        task.mark_completed(now);
                        info!(
                            task_id = %task.id,
                            run_id = %run.run_id,
                            keyword = %task.keyword,
                            "task completed"
                        );
                    }
                    RunStatus::Failed => {
                        let error = run
                            .last_error
                            .clone()
                            .unwrap_or_else(|| "run failed".to_string());
                        task.register_failure(error.as_str(), now);
                        apply_decision(task, self.inner.decider.decide(task, &error), now);
                    }
                    _ => {
                        task.revert_to_pending(now);
                        info!(task_id = %task.id, run_id = %run.run_id, "task returned to pending");
                    }
                }
                task.fold_counts(run.result_counts());
                Some(task.status)
            }
            None => {
                warn!(task_id = %run.task_id, run_id = %run.run_id, "finished run has no task");
                None
            }
        };
        self.persist_backlog(&state.backlog).await?;
        self.inner.store.remove(keys::ACTIVE_RUN).await?;
        Ok(task_status)
    }

    async fn deliver(&self, run: &Run, telemetry: &QueueTelemetry) {
        if !self.inner.delivery.try_send(run).await {
            warn!(run_id = %run.run_id, "run delivery deferred to buffer");
        }
        self.inner.telemetry.notify(telemetry, true).await;
    }

    /// Halt the driver at its next suspension point. The Run stays active.
    pub async fn pause(&self) -> Result<(), GleanerError> {
        let driver = {
            let mut state = self.inner.state.lock().await;
            if !state.meta.paused {
                state.meta.paused = true;
                self.persist_meta(&state.meta).await?;
                info!("scheduler paused");
            }
            state.driver.take()
        };
        if let Some(driver) = driver {
            driver.signal_and_join(RunControl::Pause).await;
        }
        Ok(())
    }

    /// The next tick re-attaches a driver to the active Run, or selects one.
    pub async fn resume(&self) -> Result<(), GleanerError> {
        let mut state = self.inner.state.lock().await;
        if state.meta.paused {
            state.meta.paused = false;
            self.persist_meta(&state.meta).await?;
            info!("scheduler resumed");
        }
        Ok(())
    }

    /// Stop the active Run: no further navigation, Task back to `pending`.
    /// Leaves the Scheduler paused.
    ///
    /// The partial Run is staged in the Delivery Buffer; the next tick's flush
    /// delivers it. No sink call happens here.
    pub async fn stop(&self) -> Result<Option<RunId>, GleanerError> {
        let driver = {
            let mut state = self.inner.state.lock().await;
            state.meta.paused = true;
            self.persist_meta(&state.meta).await?;
            state.driver.take()
        };
        if let Some(driver) = driver {
            driver.signal_and_join(RunControl::Stop).await;
        }

        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock().await;
        let Some(mut run) = state.active_run.clone() else {
            info!("stop requested with no active run; scheduler paused");
            return Ok(None);
        };
        run.stop(now);
        self.finalize_locked(&mut state, &run, now).await?;
        let telemetry = telemetry_of(&state);
        drop(state);

        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.inner.telemetry.notify(&telemetry, true).await;
        });
        info!(run_id = %run.run_id, status = ?run.status, "run stopped");
        Ok(Some(run.run_id))
    }

    /// Detach the driver for process shutdown without touching the paused flag.
    ///
    /// The active Run stays persisted and resumes after the next `restore`.
    pub async fn shutdown(&self) {
        let driver = self.inner.state.lock().await.driver.take();
        if let Some(driver) = driver {
            driver.signal_and_join(RunControl::Pause).await;
        }
    }

    pub async fn status(&self) -> SchedulerStatus {
        let buffered_deliveries = self.inner.delivery.len().await;
        let state = self.inner.state.lock().await;
        SchedulerStatus {
            active_run: state.active_run.as_ref().map(ActiveRunView::from),
            queue: state.backlog.summary(),
            paused: state.meta.paused,
            buffered_deliveries,
            failed_tasks: state.backlog.failed_tasks(),
            last_cycle_at: state.meta.last_cycle_at,
        }
    }

    pub async fn task(&self, id: TaskId) -> Option<TaskRecord> {
        self.inner.state.lock().await.backlog.get(id).cloned()
    }

    pub async fn tasks(&self) -> Vec<TaskRecord> {
        self.inner.state.lock().await.backlog.tasks().to_vec()
    }

    /// Wait until the current driver (if any) exits.
    pub async fn wait_for_driver(&self) {
        let done = {
            let state = self.inner.state.lock().await;
            state.driver.as_ref().map(|d| d.done_signal())
        };
        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    fn runner_deps(&self) -> RunnerDeps {
        RunnerDeps {
            state: self.inner.state.clone(),
            store: self.inner.store.clone(),
            executor: self.inner.executor.clone(),
            clock: self.inner.clock.clone(),
            markers: self.inner.markers.clone(),
            settings: self.inner.settings.clone(),
        }
    }

    async fn persist_backlog(&self, backlog: &Backlog) -> Result<(), StoreError> {
        store::save(self.inner.store.as_ref(), keys::BACKLOG, backlog).await
    }

    async fn persist_meta(&self, meta: &SchedulerMeta) -> Result<(), StoreError> {
        store::save(self.inner.store.as_ref(), keys::SCHEDULER_META, meta).await
    }
}

fn select_ready(backlog: &Backlog, now: DateTime<Utc>) -> Option<TaskId> {
    backlog
        .select_pending(now)
        .or_else(|| backlog.select_retry(now))
}

fn apply_decision(task: &mut TaskRecord, decision: Decision, now: DateTime<Utc>) {
    match decision {
        Decision::Retry { delay, reason } => {
            let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            let next_retry_at = now + delay;
            task.schedule_retry(next_retry_at, now);
            warn!(
                task_id = %task.id,
                keyword = %task.keyword,
                retry_count = task.retry_count,
                next_retry_at = %next_retry_at,
                reason = %reason,
                "run failed; retry scheduled"
            );
        }
        Decision::GiveUp { reason } => {
            task.give_up(now);
            error!(
                task_id = %task.id,
                keyword = %task.keyword,
                retry_count = task.retry_count,
                reason = %reason,
                "run failed; giving up"
            );
        }
    }
}

fn telemetry_of(state: &SchedulerState) -> QueueTelemetry {
    QueueTelemetry {
        queue: state.backlog.summary(),
        last_cycle_at: state.meta.last_cycle_at,
    }
}
