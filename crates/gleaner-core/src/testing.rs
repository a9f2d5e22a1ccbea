//! Test doubles: a scripted executor and a recording sink.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Notify;

use crate::domain::{Category, ListedItem, Run};
use crate::ports::{
    BrowsingExecutor, DeliverySink, Enrichment, ExecutorError, KeywordRecommendation, ListPage,
    Observation, QueueTelemetry, SinkError,
};

/// Pauses a list call until the test releases it.
#[derive(Default)]
pub struct Hold {
    pub reached: Notify,
    pub release: Notify,
}

#[derive(Default)]
struct Script {
    pages: HashMap<(Category, u32), ListPage>,
    list_errors: HashMap<(Category, u32), (ExecutorError, bool)>,
    holds: HashMap<(Category, u32), Arc<Hold>>,
    enrich_error: Option<ExecutorError>,
    observation: Observation,
    list_calls: Vec<(Category, u32)>,
    enrich_calls: usize,
}

pub struct ScriptedExecutor {
    script: Mutex<Script>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        let script = Script {
            observation: Observation {
                url: Some("https://m.example/search".into()),
                status_code: Some(200),
                title: Some("Search results".into()),
                body_excerpt: None,
            },
            ..Script::default()
        };
        Self {
            script: Mutex::new(script),
        }
    }

    /// `count` items with distinct locators; `has_next` sets a next-page token.
    pub fn with_page(self, category: Category, page: u32, count: usize, has_next: bool) -> Self {
        let items = (0..count)
            .map(|i| {
                ListedItem::new(
                    format!("https://m.example/{category}/{page}/{i}"),
                    format!("{category} {page}.{i}"),
                )
            })
            .collect();
        let list_page = ListPage {
            items,
            next_page_token: has_next.then(|| format!("p{}", page + 1)),
        };
        self.script.lock().unwrap().pages.insert((category, page), list_page);
        self
    }

    /// Every call for this page fails.
    pub fn with_list_error(self, category: Category, page: u32, error: ExecutorError) -> Self {
        self.script
            .lock()
            .unwrap()
            .list_errors
            .insert((category, page), (error, false));
        self
    }

    /// The next call for this page fails; later calls succeed.
    pub fn with_list_error_once(self, category: Category, page: u32, error: ExecutorError) -> Self {
        self.script
            .lock()
            .unwrap()
            .list_errors
            .insert((category, page), (error, true));
        self
    }

    pub fn failing_enrichment(self, error: ExecutorError) -> Self {
        self.script.lock().unwrap().enrich_error = Some(error);
        self
    }

    pub fn hold_page(&self, category: Category, page: u32) -> Arc<Hold> {
        let hold = Arc::new(Hold::default());
        self.script
            .lock()
            .unwrap()
            .holds
            .insert((category, page), hold.clone());
        hold
    }

    pub fn set_status_code(&self, status: u16) {
        self.script.lock().unwrap().observation.status_code = Some(status);
    }

    pub fn list_calls(&self) -> usize {
        self.script.lock().unwrap().list_calls.len()
    }

    pub fn listed_pages(&self) -> Vec<(Category, u32)> {
        self.script.lock().unwrap().list_calls.clone()
    }

    pub fn enrich_calls(&self) -> usize {
        self.script.lock().unwrap().enrich_calls
    }
}

#[async_trait]
impl BrowsingExecutor for ScriptedExecutor {
    async fn list_page(
        &self,
        category: Category,
        _keyword: &str,
        page_index: u32,
    ) -> Result<ListPage, ExecutorError> {
        let key = (category, page_index);
        let hold = self.script.lock().unwrap().holds.remove(&key);
        if let Some(hold) = hold {
            hold.reached.notify_one();
            hold.release.notified().await;
        }

        let mut script = self.script.lock().unwrap();
        script.list_calls.push(key);
        if let Some((error, once)) = script.list_errors.get(&key).cloned() {
            if once {
                script.list_errors.remove(&key);
            }
            return Err(error);
        }
        Ok(script.pages.get(&key).cloned().unwrap_or_default())
    }

    async fn enrich(
        &self,
        _category: Category,
        dedupe_key: &str,
        _locator: &str,
    ) -> Result<Enrichment, ExecutorError> {
        let mut script = self.script.lock().unwrap();
        script.enrich_calls += 1;
        if let Some(error) = script.enrich_error.clone() {
            return Err(error);
        }
        let mut fields = Map::new();
        fields.insert("detail_key".into(), Value::from(dedupe_key));
        Ok(Enrichment { fields })
    }

    async fn observe(&self) -> Result<Observation, ExecutorError> {
        Ok(self.script.lock().unwrap().observation.clone())
    }
}

#[derive(Default)]
struct SinkLog {
    down: bool,
    hanging: bool,
    calls: usize,
    ingested: Vec<Run>,
    telemetry: Vec<QueueTelemetry>,
    recommendations: Vec<KeywordRecommendation>,
    recommendation_calls: usize,
}

#[derive(Default)]
pub struct RecordingSink {
    log: Mutex<SinkLog>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// While down every call fails with HTTP 503.
    pub fn set_down(&self, down: bool) {
        self.log.lock().unwrap().down = down;
    }

    /// While hanging no call ever returns; callers see only their own timeout.
    pub fn set_hanging(&self, hanging: bool) {
        self.log.lock().unwrap().hanging = hanging;
    }

    /// Every call made, including ones that are still hanging.
    pub fn calls(&self) -> usize {
        self.log.lock().unwrap().calls
    }

    async fn enter(&self) {
        let hanging = {
            let mut log = self.log.lock().unwrap();
            log.calls += 1;
            log.hanging
        };
        if hanging {
            std::future::pending::<()>().await;
        }
    }

    pub fn set_recommendations(&self, recommendations: Vec<KeywordRecommendation>) {
        self.log.lock().unwrap().recommendations = recommendations;
    }

    pub fn ingested(&self) -> Vec<Run> {
        self.log.lock().unwrap().ingested.clone()
    }

    pub fn telemetry_count(&self) -> usize {
        self.log.lock().unwrap().telemetry.len()
    }

    pub fn recommendation_calls(&self) -> usize {
        self.log.lock().unwrap().recommendation_calls
    }
}

#[async_trait]
impl DeliverySink for RecordingSink {
    async fn ingest_run(&self, run: &Run) -> Result<(), SinkError> {
        self.enter().await;
        let mut log = self.log.lock().unwrap();
        if log.down {
            return Err(SinkError::Status(503));
        }
        log.ingested.push(run.clone());
        Ok(())
    }

    async fn recommended_keywords(
        &self,
        limit: usize,
    ) -> Result<Vec<KeywordRecommendation>, SinkError> {
        self.enter().await;
        let mut log = self.log.lock().unwrap();
        log.recommendation_calls += 1;
        if log.down {
            return Err(SinkError::Status(503));
        }
        Ok(log.recommendations.iter().take(limit).cloned().collect())
    }

    async fn queue_telemetry(&self, telemetry: &QueueTelemetry) -> Result<(), SinkError> {
        self.enter().await;
        let mut log = self.log.lock().unwrap();
        if log.down {
            return Err(SinkError::Status(503));
        }
        log.telemetry.push(telemetry.clone());
        Ok(())
    }
}
