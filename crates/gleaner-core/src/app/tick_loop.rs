//! TickLoop - 一定間隔で `Scheduler::tick` を回すループ
//!
//! - `shutdown_and_join` で止まる（watch チャネル）
//! - tick のエラーはログに出して次の tick へ（ループは止めない）

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::scheduler::{Scheduler, TickAction};

pub struct TickLoop {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl TickLoop {
    pub fn spawn(scheduler: Scheduler, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            tick_loop(scheduler, interval, &mut shutdown_rx).await;
        });
        Self { shutdown_tx, join }
    }

    pub fn request_shutdown(&self) {
        // receiver is gone once the loop has exited
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop ticking and wait for the loop. The active Run's driver is left alone.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(e) = self.join.await {
            error!(error = %e, "tick loop ended abnormally");
        }
    }
}

async fn tick_loop(
    scheduler: Scheduler,
    interval: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_ms = interval.as_millis() as u64, "tick loop started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown_rx.changed() => continue,
            _ = ticker.tick() => {}
        }

        match scheduler.tick().await {
            Ok(report) => match report.action {
                TickAction::Idle | TickAction::Driving { .. } | TickAction::Paused => {}
                action => debug!(?action, "tick"),
            },
            Err(e) => error!(error = %e, kind = ?e.kind(), "tick failed"),
        }
    }
    info!("tick loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{SchedulerBuilder, SchedulerSettings};
    use crate::domain::Category;
    use crate::impls::MemoryStore;
    use crate::monitor::ThrottlePolicy;
    use crate::queue::{TaskOptions, TaskStatus};
    use crate::testing::{RecordingSink, ScriptedExecutor};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn loop_drives_a_task_to_completion_and_stops() {
        let executor = ScriptedExecutor::new().with_page(Category::Jobs, 1, 2, false);
        let sink = Arc::new(RecordingSink::new());
        let app = SchedulerBuilder::new()
            .store(Arc::new(MemoryStore::new()))
            .executor(Arc::new(executor))
            .sink(sink.clone())
            .throttle_policy(ThrottlePolicy::none())
            .settings(SchedulerSettings {
                recycle_batch_size: 0,
                ..SchedulerSettings::default()
            })
            .build()
            .unwrap();
        let options = TaskOptions {
            categories: vec![Category::Jobs],
            max_pages_per_category: 1,
            ..TaskOptions::default()
        };
        let report = app
            .scheduler
            .enqueue(&["x".to_string()], &options)
            .await
            .unwrap();

        let ticks = TickLoop::spawn(app.scheduler.clone(), Duration::from_secs(3));
        tokio::time::sleep(Duration::from_secs(10)).await;
        ticks.shutdown_and_join().await;

        let task = app.scheduler.task(report.added[0]).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(sink.ingested().len(), 1);
        app.scheduler.shutdown().await;
    }
}
