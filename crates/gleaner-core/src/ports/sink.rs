//! DeliverySink port - 下流の分析システム
//!
//! すべての呼び出しは best-effort。失敗は呼び出し側（Delivery Buffer /
//! Telemetry Debouncer / Scheduler）が吸収し、スケジューラを止めない。

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Category, Item, PriorityTier, Run, RunId, RunStatus, TaskId};
use crate::queue::QueueSummary;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("sink request timed out")]
    Timeout,

    #[error("sink responded with HTTP {0}")]
    Status(u16),

    #[error("sink transport error: {0}")]
    Transport(String),

    #[error("sink response could not be decoded: {0}")]
    Decode(String),
}

/// Body of `POST /v1/ingest/run`.
#[derive(Debug, Clone, Serialize)]
pub struct IngestRequest<'a> {
    pub run_id: RunId,
    pub run: IngestRun<'a>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRun<'a> {
    pub task_id: TaskId,
    pub keyword: &'a str,
    pub status: RunStatus,
    pub data: BTreeMap<Category, &'a [Item]>,
    pub pages_visited: u32,
    pub details_visited: u32,
    pub details_failed: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<&'a str>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl<'a> IngestRequest<'a> {
    /// Every category of the Run appears in `data`, empty or not.
    pub fn from_run(run: &'a Run) -> Self {
        let data = run
            .categories
            .iter()
            .map(|c| {
                let items = run.items.get(c).map(Vec::as_slice).unwrap_or(&[]);
                (*c, items)
            })
            .collect();
        Self {
            run_id: run.run_id,
            run: IngestRun {
                task_id: run.task_id,
                keyword: &run.keyword,
                status: run.status,
                data,
                pages_visited: run.pages_visited,
                details_visited: run.details_visited,
                details_failed: run.details_failed,
                last_error: run.last_error.as_deref(),
                started_at: run.started_at,
                finished_at: run.finished_at,
            },
        }
    }
}

/// One entry of `GET /v1/recommendations/keywords`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordRecommendation {
    pub keyword: String,
    #[serde(default)]
    pub recommended_priority: PriorityTier,
    #[serde(default)]
    pub opportunity_score: f64,
}

impl KeywordRecommendation {
    /// `opportunity_score` clamped into the 0..=100 estimated-value range.
    pub fn estimated_value(&self) -> f64 {
        if self.opportunity_score.is_finite() {
            self.opportunity_score.clamp(0.0, 100.0)
        } else {
            0.0
        }
    }
}

/// Body of `POST /v1/telemetry/queue`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueTelemetry {
    #[serde(flatten)]
    pub queue: QueueSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Idempotent by `run.run_id`.
    async fn ingest_run(&self, run: &Run) -> Result<(), SinkError>;

    async fn recommended_keywords(
        &self,
        limit: usize,
    ) -> Result<Vec<KeywordRecommendation>, SinkError>;

    async fn queue_telemetry(&self, telemetry: &QueueTelemetry) -> Result<(), SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ListedItem;
    use chrono::TimeZone;
    use serde_json::json;
    use ulid::Ulid;

    #[test]
    fn ingest_body_lists_every_requested_category() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        let mut run = Run::new(
            RunId::from_ulid(Ulid::new()),
            TaskId::from_ulid(Ulid::new()),
            "rust",
            vec![Category::Jobs, Category::Talent],
            1,
            now,
        );
        run.record_list_page(vec![ListedItem::new("https://m.example/j/1", "one")], false, now);

        let body = serde_json::to_value(IngestRequest::from_run(&run)).unwrap();
        assert_eq!(body["run_id"], json!(run.run_id.to_string()));
        assert_eq!(body["run"]["keyword"], json!("rust"));
        assert_eq!(body["run"]["status"], json!("running"));
        assert_eq!(body["run"]["data"]["jobs"].as_array().unwrap().len(), 1);
        assert_eq!(body["run"]["data"]["talent"], json!([]));
    }

    #[test]
    fn recommendation_decodes_sink_shape() {
        let rec: KeywordRecommendation = serde_json::from_value(json!({
            "keyword": "playwright",
            "recommended_priority": "HIGH",
            "opportunity_score": 140.0
        }))
        .unwrap();
        assert_eq!(rec.recommended_priority, PriorityTier::High);
        assert_eq!(rec.estimated_value(), 100.0);
    }
}
