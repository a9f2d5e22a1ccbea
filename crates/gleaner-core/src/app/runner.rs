//! Run driver - アクティブ Run 1 本を進める tokio タスク
//!
//! - 1 ステップ（ナビゲーション 1 回）ごとに Run を共有状態へ書き戻して永続化
//! - ステップ間はスロットルで待つ
//! - 検知イベント（challenge / rateLimited / sessionExpired）で block または fail
//! - pause / stop は `watch` で受け取り、ステップ間と待機中に反映する
//!
//! Run が terminal になったら書き戻して終了するだけで、Task への反映は
//! スケジューラの tick が行います。

use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::scheduler::{SchedulerSettings, SchedulerState};
use crate::domain::{BlockReason, Run, RunBlock};
use crate::monitor::{HealthMarkers, Pause, SessionHealth};
use crate::ports::store::{self, keys};
use crate::ports::{BrowsingExecutor, Clock, KvStore};
use crate::run::{StepContext, StepOutcome, step};

/// Control signal for the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunControl {
    Continue,
    Pause,
    Stop,
}

pub(crate) struct RunnerDeps {
    pub state: Arc<Mutex<SchedulerState>>,
    pub store: Arc<dyn KvStore>,
    pub executor: Arc<dyn BrowsingExecutor>,
    pub clock: Arc<dyn Clock>,
    pub markers: HealthMarkers,
    pub settings: SchedulerSettings,
}

/// Handle to a spawned driver.
pub(crate) struct RunnerHandle {
    control: watch::Sender<RunControl>,
    done: watch::Receiver<bool>,
    join: JoinHandle<()>,
}

impl RunnerHandle {
    pub fn spawn(deps: RunnerDeps, run: Run) -> Self {
        let (control, control_rx) = watch::channel(RunControl::Continue);
        let (done_tx, done) = watch::channel(false);
        let join = tokio::spawn(async move {
            let _done = DoneGuard(done_tx);
            drive(deps, run, control_rx).await;
        });
        Self {
            control,
            done,
            join,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn done_signal(&self) -> watch::Receiver<bool> {
        self.done.clone()
    }

    /// Ask the driver to leave at its next suspension point and wait for it.
    pub async fn signal_and_join(self, control: RunControl) {
        // receiver may already be gone if the driver finished
        let _ = self.control.send(control);
        if let Err(e) = self.join.await {
            warn!(error = %e, "run driver ended abnormally");
        }
    }
}

/// Flips the done flag however the driver exits.
struct DoneGuard(watch::Sender<bool>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let _ = self.0.send(true);
    }
}

enum Flow {
    Continue,
    Exit,
}

async fn drive(deps: RunnerDeps, mut run: Run, mut control: watch::Receiver<RunControl>) {
    let ctx = StepContext {
        executor: deps.executor.as_ref(),
        markers: &deps.markers,
        clock: deps.clock.as_ref(),
        navigation_timeout: deps.settings.navigation_timeout,
    };
    let mut rng = StdRng::from_entropy();

    info!(run_id = %run.run_id, task_id = %run.task_id, keyword = %run.keyword, "run driver started");

    loop {
        if *control.borrow() != RunControl::Continue {
            debug!(run_id = %run.run_id, "run driver leaving on control signal");
            return;
        }
        if run.is_terminal() {
            return;
        }

        if let Some(block) = run.block.clone() {
            match wait_out_block(&deps, &ctx, &mut run, block, &mut control).await {
                Flow::Continue => continue,
                Flow::Exit => return,
            }
        }

        let outcome = step(&mut run, &ctx).await;
        let now = deps.clock.now();
        match outcome {
            StepOutcome::Advanced { latency } => {
                if !publish(&deps, &run).await {
                    return;
                }
                if run.is_terminal() {
                    info!(run_id = %run.run_id, status = ?run.status, "run driver finished");
                    return;
                }
                let pause = {
                    let mut state = deps.state.lock().await;
                    state.throttle.record_latency(latency);
                    state.throttle.next_pause(now, &mut rng)
                };
                if let Pause::Cooldown(d) = pause {
                    info!(run_id = %run.run_id, cooldown_secs = d.as_secs(), "session cooldown");
                }
                if !sleep_unless_signalled(pause.duration(), &mut control).await {
                    return;
                }
            }
            StepOutcome::Detected(reason) => {
                apply_detection(&deps, &mut run, reason);
                if !publish(&deps, &run).await || run.is_terminal() {
                    return;
                }
            }
            StepOutcome::Failed(_) | StepOutcome::Finished => {
                publish(&deps, &run).await;
                info!(run_id = %run.run_id, status = ?run.status, "run driver finished");
                return;
            }
        }
    }
}

fn apply_detection(deps: &RunnerDeps, run: &mut Run, reason: BlockReason) {
    let now = deps.clock.now();
    match reason {
        BlockReason::SessionExpired => {
            warn!(run_id = %run.run_id, keyword = %run.keyword, "session expired; failing run");
            run.fail("session expired", now);
        }
        BlockReason::Challenge => {
            warn!(run_id = %run.run_id, keyword = %run.keyword, "challenge detected; run blocked");
            run.block(BlockReason::Challenge, None, now);
        }
        BlockReason::RateLimited => {
            let cooldown = chrono::Duration::from_std(deps.settings.rate_limit_cooldown)
                .unwrap_or(chrono::Duration::zero());
            let resume_at = now + cooldown;
            warn!(run_id = %run.run_id, resume_at = %resume_at, "rate limited; run paused");
            run.block(BlockReason::RateLimited, Some(resume_at), now);
        }
    }
}

/// Wait until a block clears.
async fn wait_out_block(
    deps: &RunnerDeps,
    ctx: &StepContext<'_>,
    run: &mut Run,
    block: RunBlock,
    control: &mut watch::Receiver<RunControl>,
) -> Flow {
    match block.reason {
        BlockReason::RateLimited => {
            let resume_at = block.resume_at.unwrap_or(block.since);
            let wait = (resume_at - deps.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            if !sleep_unless_signalled(wait, control).await {
                return Flow::Exit;
            }
            run.unblock(deps.clock.now());
            info!(run_id = %run.run_id, "rate-limit cooldown over; run resumed");
            if publish(deps, run).await {
                Flow::Continue
            } else {
                Flow::Exit
            }
        }
        BlockReason::Challenge => loop {
            if !sleep_unless_signalled(deps.settings.challenge_poll_interval, control).await {
                return Flow::Exit;
            }
            match ctx.check_health().await {
                SessionHealth::Healthy => {
                    run.unblock(deps.clock.now());
                    info!(run_id = %run.run_id, "challenge cleared; run resumed");
                }
                SessionHealth::Challenge => {
                    debug!(run_id = %run.run_id, "still challenged");
                    continue;
                }
                SessionHealth::SessionExpired => {
                    apply_detection(deps, run, BlockReason::SessionExpired);
                }
                SessionHealth::RateLimited => {
                    run.unblock(deps.clock.now());
                    apply_detection(deps, run, BlockReason::RateLimited);
                }
            }
            let published = publish(deps, run).await;
            return if published && !run.is_terminal() {
                Flow::Continue
            } else {
                Flow::Exit
            };
        },
        BlockReason::SessionExpired => {
            apply_detection(deps, run, BlockReason::SessionExpired);
            publish(deps, run).await;
            Flow::Exit
        }
    }
}

/// Sleep for `duration`; false if a pause/stop arrived (or the handle was dropped).
async fn sleep_unless_signalled(
    duration: Duration,
    control: &mut watch::Receiver<RunControl>,
) -> bool {
    let deadline = tokio::time::Instant::now() + duration;
    loop {
        if *control.borrow_and_update() != RunControl::Continue {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return true,
            changed = control.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

/// Write the Run back into shared state and the store.
///
/// Returns false when this Run is no longer the active one; the driver must exit.
async fn publish(deps: &RunnerDeps, run: &Run) -> bool {
    let mut state = deps.state.lock().await;
    match &state.active_run {
        Some(active) if active.run_id == run.run_id => {}
        _ => {
            warn!(run_id = %run.run_id, "run is no longer active; driver exiting");
            return false;
        }
    }
    state.active_run = Some(run.clone());
    if let Err(e) = store::save(deps.store.as_ref(), keys::ACTIVE_RUN, run).await {
        warn!(run_id = %run.run_id, error = %e, "failed to persist active run");
    }
    true
}
