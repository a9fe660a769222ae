//! Search index backend: bulk-indexes events over HTTP, creating the index
//! on first use if the endpoint reports it missing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use jt_protocol::Envelope;
use serde_json::json;
use tracing::warn;

use super::{BackendAdapter, SendResult};
use crate::error::BackendError;

pub struct SearchIndexBackend {
    client: reqwest::Client,
    endpoint: String,
    index: String,
    index_ready: AtomicBool,
}

impl SearchIndexBackend {
    pub fn new(endpoint: impl Into<String>, index: impl Into<String>) -> Self {
        SearchIndexBackend {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            index: index.into(),
            index_ready: AtomicBool::new(false),
        }
    }

    fn index_url(&self) -> String {
        format!("{}/{}", self.endpoint.trim_end_matches('/'), self.index)
    }

    fn bulk_url(&self) -> String {
        format!("{}/_bulk", self.index_url())
    }

    async fn ensure_index(&self) -> Result<(), BackendError> {
        if self.index_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let resp = self
            .client
            .put(self.index_url())
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        // A 400 here usually means the index already exists; anything else
        // that isn't a plain success is a real failure.
        if resp.status().is_success() || resp.status().as_u16() == 400 {
            self.index_ready.store(true, Ordering::Release);
            Ok(())
        } else {
            Err(BackendError::Rejected(format!(
                "index creation returned {}",
                resp.status()
            )))
        }
    }

    fn bulk_body(messages: &[Envelope]) -> String {
        let mut body = String::new();
        for envelope in messages {
            body.push_str(&json!({"index": {}}).to_string());
            body.push('\n');
            let line = jt_protocol::encode(envelope).unwrap_or_default();
            body.push_str(String::from_utf8_lossy(&line).trim_end());
            body.push('\n');
        }
        body
    }
}

#[async_trait]
impl BackendAdapter for SearchIndexBackend {
    async fn init(&self) -> Result<(), BackendError> {
        self.ensure_index().await
    }

    async fn send_batch(&self, messages: &[Envelope]) -> SendResult {
        let start = Instant::now();
        if messages.is_empty() {
            return SendResult::all_sent(0, start.elapsed());
        }

        if let Err(e) = self.ensure_index().await {
            warn!(error = %e, "failed to ensure search index exists");
            return SendResult::failed(messages.len(), e.to_string(), start.elapsed());
        }

        let resp = self
            .client
            .post(self.bulk_url())
            .header("content-type", "application/x-ndjson")
            .body(Self::bulk_body(messages))
            .send()
            .await;

        match resp {
            Ok(r) if r.status().is_success() => {
                SendResult::all_sent(messages.len(), start.elapsed())
            }
            Ok(r) => SendResult::failed(
                messages.len(),
                format!("bulk index returned {}", r.status()),
                start.elapsed(),
            ),
            Err(e) => SendResult::failed(messages.len(), e.to_string(), start.elapsed()),
        }
    }

    async fn health(&self) -> bool {
        self.client
            .get(self.index_url())
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use jt_protocol::{EventPayload, Level, Payload};

    #[test]
    fn bulk_body_emits_one_action_and_one_source_line_per_message() {
        let envelope = Envelope::new(
            "svc",
            jt_protocol::now_millis(),
            Payload::Event(EventPayload {
                level: Level::Info,
                msg: "hi".to_owned(),
                ctx: None,
            }),
        );
        let body = SearchIndexBackend::bulk_body(&[envelope]);
        assert_eq!(body.lines().count(), 2);
        assert!(body.lines().next().unwrap().contains("\"index\""));
    }

    #[test]
    fn empty_batch_has_no_bulk_lines() {
        assert_eq!(SearchIndexBackend::bulk_body(&[]), "");
    }
}
