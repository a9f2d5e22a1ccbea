//! Telemetry Debouncer - キュー状況の送信頻度を抑える
//!
//! 最後に *成功した* 送信から `min_interval` 経過していれば送る。
//! `force` は Run の終了時など、必ず送りたいときに使う。失敗は握りつぶす。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::ports::{Clock, DeliverySink, QueueTelemetry, SinkError};

pub struct TelemetryDebouncer {
    sink: Arc<dyn DeliverySink>,
    clock: Arc<dyn Clock>,
    min_interval: Duration,
    sink_timeout: Duration,
    last_success: Mutex<Option<DateTime<Utc>>>,
}

impl TelemetryDebouncer {
    pub fn new(
        sink: Arc<dyn DeliverySink>,
        clock: Arc<dyn Clock>,
        min_interval: Duration,
        sink_timeout: Duration,
    ) -> Self {
        Self {
            sink,
            clock,
            min_interval,
            sink_timeout,
            last_success: Mutex::new(None),
        }
    }

    /// Returns true when the summary was pushed successfully.
    pub async fn notify(&self, telemetry: &QueueTelemetry, force: bool) -> bool {
        let mut last_success = self.last_success.lock().await;
        let now = self.clock.now();
        let due = match *last_success {
            None => true,
            Some(at) => (now - at).to_std().unwrap_or(Duration::ZERO) >= self.min_interval,
        };
        if !force && !due {
            return false;
        }

        let result = match tokio::time::timeout(
            self.sink_timeout,
            self.sink.queue_telemetry(telemetry),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout),
        };
        match result {
            Ok(()) => {
                *last_success = Some(now);
                debug!(force, total = telemetry.queue.total, "queue telemetry pushed");
                true
            }
            Err(e) => {
                warn!(error = %e, "queue telemetry push failed");
                false
            }
        }
    }
}
