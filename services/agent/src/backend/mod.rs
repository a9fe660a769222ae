//! Backend Adapter interface: the uniform capability every sink implements
//! so the router can fan out without knowing what's on the other end.

mod filesystem;
mod managed;
mod object_store;
mod search_index;

pub use filesystem::FilesystemBackend;
pub use managed::ManagedBackend;
pub use object_store::ObjectStoreBackend;
pub use search_index::SearchIndexBackend;

use std::time::Duration;

use async_trait::async_trait;
use jt_protocol::Envelope;

use crate::error::BackendError;

#[derive(Debug, Clone)]
pub struct SendResult {
    pub ok: bool,
    pub count_sent: usize,
    pub count_failed: usize,
    pub error: Option<String>,
    pub latency: Duration,
}

impl SendResult {
    pub fn all_sent(count: usize, latency: Duration) -> Self {
        SendResult {
            ok: true,
            count_sent: count,
            count_failed: 0,
            error: None,
            latency,
        }
    }

    pub fn failed(count: usize, error: impl Into<String>, latency: Duration) -> Self {
        SendResult {
            ok: false,
            count_sent: 0,
            count_failed: count,
            error: Some(error.into()),
            latency,
        }
    }
}

/// Each adapter is constructed from a typed config record (see
/// `crate::config::BackendKind`) and owns its own connection pooling and
/// within-batch retries; cross-batch retry is the router's concern.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    async fn init(&self) -> Result<(), BackendError>;
    async fn send_batch(&self, messages: &[Envelope]) -> SendResult;
    async fn health(&self) -> bool;
    async fn close(&self);
}
