//! HttpSink - DeliverySink over HTTP (reqwest)
//!
//! - `POST {base}/v1/ingest/run`
//! - `GET  {base}/v1/recommendations/keywords?limit=N`
//! - `POST {base}/v1/telemetry/queue`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response};

use crate::domain::Run;
use crate::ports::{DeliverySink, IngestRequest, KeywordRecommendation, QueueTelemetry, SinkError};

pub struct HttpSink {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::Transport(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, SinkError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        if !response.status().is_success() {
            return Err(SinkError::Status(response.status().as_u16()));
        }
        Ok(response)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> SinkError {
    if e.is_timeout() {
        SinkError::Timeout
    } else if e.is_decode() {
        SinkError::Decode(e.to_string())
    } else {
        SinkError::Transport(e.to_string())
    }
}

#[async_trait]
impl DeliverySink for HttpSink {
    async fn ingest_run(&self, run: &Run) -> Result<(), SinkError> {
        let body = IngestRequest::from_run(run);
        self.send(self.client.post(self.url("/v1/ingest/run")).json(&body))
            .await?;
        Ok(())
    }

    async fn recommended_keywords(
        &self,
        limit: usize,
    ) -> Result<Vec<KeywordRecommendation>, SinkError> {
        let response = self
            .send(
                self.client
                    .get(self.url("/v1/recommendations/keywords"))
                    .query(&[("limit", limit)]),
            )
            .await?;
        response.json().await.map_err(map_reqwest_error)
    }

    async fn queue_telemetry(&self, telemetry: &QueueTelemetry) -> Result<(), SinkError> {
        self.send(
            self.client
                .post(self.url("/v1/telemetry/queue"))
                .json(telemetry),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PriorityTier;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and return the request line.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            request.lines().next().unwrap_or_default().to_string()
        });
        (base, handle)
    }

    #[tokio::test]
    async fn recommendations_are_decoded() {
        let (base, server) = serve_once(
            "200 OK",
            r#"[{"keyword":"scrapy","recommended_priority":"CRITICAL","opportunity_score":88.5}]"#,
        )
        .await;
        let sink = HttpSink::new(format!("{base}/"), None, Duration::from_secs(5)).unwrap();

        let recs = sink.recommended_keywords(3).await.unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].recommended_priority, PriorityTier::Critical);

        let request_line = server.await.unwrap();
        assert!(request_line.starts_with("GET /v1/recommendations/keywords?limit=3 "));
    }

    #[tokio::test]
    async fn non_success_status_is_reported() {
        let (base, server) = serve_once("503 Service Unavailable", "{}").await;
        let sink = HttpSink::new(base, Some("k".into()), Duration::from_secs(5)).unwrap();

        let telemetry = QueueTelemetry {
            queue: Default::default(),
            last_cycle_at: None,
        };
        let err = sink.queue_telemetry(&telemetry).await.unwrap_err();
        assert_eq!(err, SinkError::Status(503));
        assert!(server.await.unwrap().starts_with("POST /v1/telemetry/queue "));
    }

    #[tokio::test]
    async fn unreachable_sink_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sink = HttpSink::new(format!("http://{addr}"), None, Duration::from_secs(2)).unwrap();
        let err = sink.recommended_keywords(1).await.unwrap_err();
        assert!(matches!(err, SinkError::Transport(_) | SinkError::Timeout));
    }
}
