//! Delivery Buffer - Sink への配送を失わないためのバッファ
//!
//! 終了した Run は `stage` でまず永続バッファに積まれ（同じ `task_run_id` は
//! 置き換え）、その後 `try_send` で即時配送を試みます。成功すればエントリは消え、
//! 失敗すれば残って `flush` が先頭から 1 件ずつ再送します（最初の失敗で停止、
//! 順序は入れ替えない）。

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::{Run, RunId};
use crate::ports::store::{self, keys};
use crate::ports::{Clock, DeliverySink, KvStore, SinkError, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryBufferEntry {
    pub task_run_id: RunId,
    pub run: Run,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub attempted: usize,
    pub delivered: usize,
    pub remaining: usize,
    /// Another flush was already running; nothing was attempted.
    pub skipped: bool,
}

/// Clears the in-flight flag when a flush ends, however it ends.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct DeliveryBuffer {
    sink: Arc<dyn DeliverySink>,
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    entries: Mutex<VecDeque<DeliveryBufferEntry>>,
    flushing: AtomicBool,
    capacity: usize,
    sink_timeout: Duration,
}

impl DeliveryBuffer {
    pub fn new(
        sink: Arc<dyn DeliverySink>,
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        capacity: usize,
        sink_timeout: Duration,
    ) -> Self {
        Self {
            sink,
            store,
            clock,
            entries: Mutex::new(VecDeque::new()),
            flushing: AtomicBool::new(false),
            capacity: capacity.max(1),
            sink_timeout,
        }
    }

    /// Load the persisted buffer. Returns the number of entries restored.
    pub async fn restore(&self) -> Result<usize, StoreError> {
        let restored: Vec<DeliveryBufferEntry> =
            store::load(self.store.as_ref(), keys::DELIVERY_BUFFER)
                .await?
                .unwrap_or_default();
        let mut entries = self.entries.lock().await;
        *entries = restored.into();
        Ok(entries.len())
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<DeliveryBufferEntry> {
        self.entries.lock().await.iter().cloned().collect()
    }

    async fn send(&self, run: &Run) -> Result<(), SinkError> {
        match tokio::time::timeout(self.sink_timeout, self.sink.ingest_run(run)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout),
        }
    }

    /// Durably record a finished Run. Must succeed before the caller forgets the Run.
    ///
    /// Replaces a snapshot already buffered under the same run id, keeping its position.
    pub async fn stage(&self, run: &Run) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        match entries.iter_mut().find(|e| e.task_run_id == run.run_id) {
            Some(existing) => existing.run = run.clone(),
            None => entries.push_back(DeliveryBufferEntry {
                task_run_id: run.run_id,
                run: run.clone(),
                queued_at: self.clock.now(),
                attempts: 0,
                last_error: None,
            }),
        }
        self.evict_overflow(&mut entries);
        store::save(self.store.as_ref(), keys::DELIVERY_BUFFER, &*entries).await?;
        debug!(run_id = %run.run_id, "run staged for delivery");
        Ok(())
    }

    /// Deliver now, or buffer on any failure. Never raises.
    pub async fn try_send(&self, run: &Run) -> bool {
        match self.send(run).await {
            Ok(()) => {
                // drops the staged entry and any older snapshot of the same run
                let mut entries = self.entries.lock().await;
                let before = entries.len();
                entries.retain(|e| e.task_run_id != run.run_id);
                if entries.len() != before {
                    self.persist(&entries).await;
                }
                info!(run_id = %run.run_id, status = ?run.status, "run delivered");
                true
            }
            Err(e) => {
                warn!(run_id = %run.run_id, error = %e, "delivery failed; buffering run");
                self.push(run.clone(), Some(e.to_string())).await;
                false
            }
        }
    }

    /// Append (or replace in place by `task_run_id`) and enforce capacity.
    pub async fn push(&self, run: Run, error: Option<String>) {
        let mut entries = self.entries.lock().await;
        let now = self.clock.now();
        match entries.iter_mut().find(|e| e.task_run_id == run.run_id) {
            Some(existing) => {
                existing.run = run;
                existing.attempts += 1;
                existing.last_error = error;
            }
            None => entries.push_back(DeliveryBufferEntry {
                task_run_id: run.run_id,
                run,
                queued_at: now,
                attempts: 1,
                last_error: error,
            }),
        }
        self.evict_overflow(&mut entries);
        self.persist(&entries).await;
    }

    fn evict_overflow(&self, entries: &mut VecDeque<DeliveryBufferEntry>) {
        while entries.len() > self.capacity {
            if let Some(evicted) = entries.pop_front() {
                warn!(
                    run_id = %evicted.task_run_id,
                    queued_at = %evicted.queued_at,
                    capacity = self.capacity,
                    "delivery buffer full; dropping oldest entry"
                );
            }
        }
    }

    /// Retry buffered entries from the head, stopping at the first failure.
    pub async fn flush(&self, max_batch: usize) -> FlushReport {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("flush already in flight");
            return FlushReport {
                skipped: true,
                ..FlushReport::default()
            };
        }
        let _guard = FlushGuard(&self.flushing);

        let mut report = FlushReport::default();
        while report.attempted < max_batch {
            let Some(head) = self.entries.lock().await.front().cloned() else {
                break;
            };
            report.attempted += 1;

            let result = self.send(&head.run).await;
            let mut entries = self.entries.lock().await;
            match result {
                Ok(()) => {
                    // try_send may have replaced the snapshot meanwhile; drop only what we sent
                    if let Some(pos) = entries
                        .iter()
                        .position(|e| e.task_run_id == head.task_run_id && e.run == head.run)
                    {
                        entries.remove(pos);
                    }
                    self.persist(&entries).await;
                    report.delivered += 1;
                    debug!(run_id = %head.task_run_id, "buffered run delivered");
                }
                Err(e) => {
                    if let Some(entry) = entries
                        .iter_mut()
                        .find(|entry| entry.task_run_id == head.task_run_id)
                    {
                        entry.attempts += 1;
                        entry.last_error = Some(e.to_string());
                    }
                    self.persist(&entries).await;
                    debug!(run_id = %head.task_run_id, error = %e, "flush stopped at first failure");
                    break;
                }
            }
        }

        report.remaining = self.entries.lock().await.len();
        if report.delivered > 0 {
            info!(
                delivered = report.delivered,
                remaining = report.remaining,
                "delivery buffer flushed"
            );
        }
        report
    }

    async fn persist(&self, entries: &VecDeque<DeliveryBufferEntry>) {
        let result = store::save(self.store.as_ref(), keys::DELIVERY_BUFFER, entries).await;
        if let Err(e) = result {
            warn!(error = %e, "failed to persist delivery buffer");
        }
    }
}
