//! Object store backend: batches events into newline-delimited JSON blobs
//! and PUTs each batch to a bucket endpoint.

use std::time::Instant;

use async_trait::async_trait;
use jt_protocol::Envelope;
use tracing::warn;
use uuid::Uuid;

use super::{BackendAdapter, SendResult};
use crate::error::BackendError;

pub struct ObjectStoreBackend {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    batch_size: usize,
}

impl ObjectStoreBackend {
    pub fn new(endpoint: impl Into<String>, bucket: impl Into<String>, batch_size: usize) -> Self {
        ObjectStoreBackend {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            batch_size: batch_size.max(1),
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.bucket,
            key
        )
    }

    async fn put_chunk(&self, chunk: &[&Envelope]) -> Result<(), BackendError> {
        let mut body = Vec::new();
        for envelope in chunk {
            let bytes = jt_protocol::encode(envelope)
                .map_err(|e| BackendError::Rejected(e.to_string()))?;
            body.extend_from_slice(&bytes);
        }

        let key = format!("{}.jsonl", Uuid::new_v4());
        let resp = self
            .client
            .put(self.object_url(&key))
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(BackendError::Rejected(format!(
                "object store returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BackendAdapter for ObjectStoreBackend {
    async fn init(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn send_batch(&self, messages: &[Envelope]) -> SendResult {
        let start = Instant::now();
        let refs: Vec<&Envelope> = messages.iter().collect();
        let mut count_sent = 0;
        let mut count_failed = 0;
        let mut last_error = None;

        for chunk in refs.chunks(self.batch_size) {
            match self.put_chunk(chunk).await {
                Ok(()) => count_sent += chunk.len(),
                Err(e) => {
                    warn!(error = %e, chunk_len = chunk.len(), "object store upload failed");
                    count_failed += chunk.len();
                    last_error = Some(e.to_string());
                }
            }
        }

        SendResult {
            ok: count_failed == 0,
            count_sent,
            count_failed,
            error: last_error,
            latency: start.elapsed(),
        }
    }

    async fn health(&self) -> bool {
        self.client
            .head(&self.endpoint)
            .send()
            .await
            .map(|r| r.status().is_success() || r.status().as_u16() == 405)
            .unwrap_or(false)
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_of_zero_is_clamped_to_one() {
        let backend = ObjectStoreBackend::new("http://localhost:9000", "events", 0);
        assert_eq!(backend.batch_size, 1);
    }

    #[test]
    fn object_url_joins_endpoint_bucket_and_key() {
        let backend = ObjectStoreBackend::new("http://localhost:9000/", "events", 10);
        assert_eq!(
            backend.object_url("abc.jsonl"),
            "http://localhost:9000/events/abc.jsonl"
        );
    }
}
