//! One step of the Run state machine against the Browsing Executor.
//!
//! A step is at most one navigation (a list page or a detail page), bracketed
//! by health checks. Detection never mutates the Run here; the driver decides
//! how to block or fail.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::domain::{BlockReason, Run, RunPhase};
use crate::monitor::{HealthMarkers, SessionHealth, classify};
use crate::ports::{BrowsingExecutor, Clock, ExecutorError};

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// One navigation happened and the Run moved forward.
    Advanced { latency: Duration },
    /// The session is blocked; the Run did not move.
    Detected(BlockReason),
    /// A list page failed for a non-detection reason; the Run is now `failed`.
    Failed(String),
    /// Nothing left to do.
    Finished,
}

pub struct StepContext<'a> {
    pub executor: &'a dyn BrowsingExecutor,
    pub markers: &'a HealthMarkers,
    pub clock: &'a dyn Clock,
    pub navigation_timeout: Duration,
}

impl StepContext<'_> {
    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, ExecutorError>>,
    ) -> Result<T, ExecutorError> {
        match tokio::time::timeout(self.navigation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::Timeout),
        }
    }

    /// Health of the session right now.
    ///
    /// An `observe` failure without a detection signal says nothing about the
    /// session, so it counts as healthy.
    pub async fn check_health(&self) -> SessionHealth {
        match self.bounded(self.executor.observe()).await {
            Ok(observation) => classify(&observation, self.markers),
            Err(e) => {
                let health = SessionHealth::from_error(&e);
                if health.is_healthy() {
                    debug!(error = %e, "observe failed; assuming healthy");
                }
                health
            }
        }
    }
}

/// Execute the next step of `run`.
pub async fn step(run: &mut Run, ctx: &StepContext<'_>) -> StepOutcome {
    if run.is_terminal() {
        return StepOutcome::Finished;
    }
    let Some(category) = run.current_category() else {
        run.complete(ctx.clock.now());
        return StepOutcome::Finished;
    };

    if let Some(reason) = ctx.check_health().await.block_reason() {
        return StepOutcome::Detected(reason);
    }

    match run.phase {
        RunPhase::List { page_index } => {
            let started = Instant::now();
            let result = ctx
                .bounded(ctx.executor.list_page(category, &run.keyword, page_index))
                .await;
            let latency = started.elapsed();
            match result {
                Ok(page) => {
                    if let Some(reason) = ctx.check_health().await.block_reason() {
                        return StepOutcome::Detected(reason);
                    }
                    debug!(
                        run_id = %run.run_id,
                        category = %category,
                        page = page_index,
                        items = page.items.len(),
                        has_next = page.has_next(),
                        "list page collected"
                    );
                    let has_next = page.has_next();
                    run.record_list_page(page.items, has_next, ctx.clock.now());
                    StepOutcome::Advanced { latency }
                }
                Err(e) => {
                    if let Some(reason) = e.block_reason() {
                        return StepOutcome::Detected(reason);
                    }
                    let message = format!("list {category} page {page_index}: {e}");
                    warn!(run_id = %run.run_id, error = %message, "list page failed");
                    run.fail(message.clone(), ctx.clock.now());
                    StepOutcome::Failed(message)
                }
            }
        }
        RunPhase::Detail { .. } => {
            let Some(entry) = run.current_detail_entry().cloned() else {
                run.complete(ctx.clock.now());
                return StepOutcome::Finished;
            };
            let started = Instant::now();
            let result = ctx
                .bounded(
                    ctx.executor
                        .enrich(entry.category, &entry.dedupe_key, &entry.locator),
                )
                .await;
            let latency = started.elapsed();
            match result {
                Ok(enrichment) => {
                    if let Some(reason) = ctx.check_health().await.block_reason() {
                        return StepOutcome::Detected(reason);
                    }
                    run.record_detail_success(enrichment.fields, ctx.clock.now());
                }
                Err(e) => {
                    if let Some(reason) = e.block_reason() {
                        return StepOutcome::Detected(reason);
                    }
                    debug!(
                        run_id = %run.run_id,
                        dedupe_key = %entry.dedupe_key,
                        error = %e,
                        "detail enrichment failed"
                    );
                    run.record_detail_failure(e.to_string(), ctx.clock.now());
                }
            }
            StepOutcome::Advanced { latency }
        }
        RunPhase::Terminal => StepOutcome::Finished,
    }
}
