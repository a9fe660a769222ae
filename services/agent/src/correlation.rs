//! Correlation / Buffer Engine: per-source accumulation with a size-or-time
//! dual flush trigger, handed off to the router in receive order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jt_protocol::Envelope;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::BufferConfig;
use crate::router::Router;

struct SourceBuffer {
    messages: Vec<Envelope>,
    first_queued_at: Instant,
}

impl SourceBuffer {
    fn new() -> Self {
        SourceBuffer {
            messages: Vec::new(),
            first_queued_at: Instant::now(),
        }
    }
}

/// Each source gets its own `Mutex<SourceBuffer>` so one source's flush
/// never blocks another's `process()` call. The outer map is locked only to
/// insert/remove an entry, never while holding a per-source lock.
pub struct CorrelationEngine {
    config: BufferConfig,
    router: Arc<Router>,
    buffers: Mutex<BTreeMap<String, Arc<Mutex<SourceBuffer>>>>,
    trace_index: Mutex<BTreeMap<String, Vec<Envelope>>>,
    time_flush_task: Mutex<Option<JoinHandle<()>>>,
}

const TRACE_INDEX_MAX_ENTRIES: usize = 10_000;

impl CorrelationEngine {
    pub fn new(config: BufferConfig, router: Arc<Router>) -> Self {
        CorrelationEngine {
            config,
            router,
            buffers: Mutex::new(BTreeMap::new()),
            trace_index: Mutex::new(BTreeMap::new()),
            time_flush_task: Mutex::new(None),
        }
    }

    /// Spawns the background time-flush loop; call once after construction.
    pub async fn spawn_time_flush(self: &Arc<Self>) {
        let engine = self.clone();
        let interval = Duration::from_secs(self.config.flush_interval_s.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                engine.flush_aged().await;
            }
        });
        *self.time_flush_task.lock().await = Some(handle);
    }

    pub async fn process(&self, envelope: Envelope) {
        if let Some(tid) = envelope.tid.clone() {
            self.index_by_trace(tid, envelope.clone()).await;
        }

        let buffer = self.buffer_for(&envelope.src).await;
        let should_flush = {
            let mut guard = buffer.lock().await;
            if guard.messages.is_empty() {
                guard.first_queued_at = Instant::now();
            }
            if guard.messages.len() >= self.config.per_source_max {
                warn!(src = %envelope.src, "per-source buffer at capacity, flushing before enqueue");
                drop(guard);
                self.flush_source(&envelope.src, &buffer).await;
                let mut guard = buffer.lock().await;
                guard.first_queued_at = Instant::now();
                guard.messages.push(envelope.clone());
                false
            } else {
                guard.messages.push(envelope.clone());
                guard.messages.len() >= self.config.flush_batch_size
            }
        };

        if should_flush {
            self.flush_source(&envelope.src, &buffer).await;
        }
    }

    async fn index_by_trace(&self, tid: String, envelope: Envelope) {
        let mut index = self.trace_index.lock().await;
        if index.len() >= TRACE_INDEX_MAX_ENTRIES && !index.contains_key(&tid) {
            // Advisory index only; drop the oldest entry rather than grow
            // unbounded under memory pressure.
            if let Some(oldest) = index.keys().next().cloned() {
                index.remove(&oldest);
            }
        }
        index.entry(tid).or_default().push(envelope);
    }

    async fn buffer_for(&self, src: &str) -> Arc<Mutex<SourceBuffer>> {
        let mut buffers = self.buffers.lock().await;
        buffers
            .entry(src.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(SourceBuffer::new())))
            .clone()
    }

    /// Flushes every source whose oldest queued message has aged past the
    /// configured interval.
    async fn flush_aged(&self) {
        let threshold = Duration::from_secs(self.config.flush_interval_s);
        let candidates: Vec<(String, Arc<Mutex<SourceBuffer>>)> = {
            let buffers = self.buffers.lock().await;
            buffers
                .iter()
                .map(|(src, buf)| (src.clone(), buf.clone()))
                .collect()
        };
        for (src, buffer) in candidates {
            let aged = {
                let guard = buffer.lock().await;
                !guard.messages.is_empty() && guard.first_queued_at.elapsed() >= threshold
            };
            if aged {
                self.flush_source(&src, &buffer).await;
            }
        }
    }

    /// Drains `buffer`'s messages (if any) and routes them. Serialized per
    /// source by the source's own mutex, so concurrent callers for the same
    /// source never overlap.
    async fn flush_source(&self, src: &str, buffer: &Arc<Mutex<SourceBuffer>>) {
        let batch = {
            let mut guard = buffer.lock().await;
            if guard.messages.is_empty() {
                return;
            }
            std::mem::take(&mut guard.messages)
        };
        debug!(src, count = batch.len(), "flushing source buffer");
        self.router.route_batch(src, batch).await;
    }

    /// Drains every source buffer unconditionally; called on shutdown.
    pub async fn flush_all(&self) {
        let entries: Vec<(String, Arc<Mutex<SourceBuffer>>)> = {
            let buffers = self.buffers.lock().await;
            buffers
                .iter()
                .map(|(src, buf)| (src.clone(), buf.clone()))
                .collect()
        };
        for (src, buffer) in entries {
            self.flush_source(&src, &buffer).await;
        }
        if let Some(handle) = self.time_flush_task.lock().await.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendAdapter, SendResult};
    use crate::config::RoutingRule;
    use async_trait::async_trait;
    use jt_protocol::{EventPayload, Level, Payload};
    use std::sync::Mutex as StdMutex;

    struct RecordingBackend {
        received: Arc<StdMutex<Vec<Envelope>>>,
    }

    #[async_trait]
    impl BackendAdapter for RecordingBackend {
        async fn init(&self) -> Result<(), crate::error::BackendError> {
            Ok(())
        }
        async fn send_batch(&self, messages: &[Envelope]) -> SendResult {
            self.received.lock().unwrap().extend_from_slice(messages);
            SendResult::all_sent(messages.len(), Duration::ZERO)
        }
        async fn health(&self) -> bool {
            true
        }
        async fn close(&self) {}
    }

    fn event(src: &str, msg: &str) -> Envelope {
        Envelope::new(
            src,
            jt_protocol::now_millis(),
            Payload::Event(EventPayload {
                level: Level::Info,
                msg: msg.to_owned(),
                ctx: None,
            }),
        )
    }

    fn engine_with_recorder(flush_batch_size: usize) -> (Arc<CorrelationEngine>, Arc<StdMutex<Vec<Envelope>>>) {
        let received = Arc::new(StdMutex::new(Vec::new()));
        let mut backends: BTreeMap<String, Arc<dyn BackendAdapter>> = BTreeMap::new();
        backends.insert(
            "rec".to_owned(),
            Arc::new(RecordingBackend {
                received: received.clone(),
            }),
        );
        let mut routing = BTreeMap::new();
        routing.insert(
            "default".to_owned(),
            vec![RoutingRule {
                backend_name: "rec".to_owned(),
                enabled: true,
                priority: 0,
                filter: None,
            }],
        );
        let router = Arc::new(Router::new(routing, backends, Duration::from_secs(30), Duration::from_secs(30)));
        let engine = Arc::new(CorrelationEngine::new(
            BufferConfig {
                flush_batch_size,
                flush_interval_s: 3600,
                per_source_max: 1000,
            },
            router,
        ));
        (engine, received)
    }

    #[tokio::test]
    async fn size_threshold_flushes_in_receive_order() {
        let (engine, received) = engine_with_recorder(2);
        engine.process(event("svc", "m1")).await;
        engine.process(event("svc", "m2")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let got = received.lock().unwrap();
        assert_eq!(got.len(), 2);
        match (&got[0].payload, &got[1].payload) {
            (Payload::Event(a), Payload::Event(b)) => {
                assert_eq!(a.msg, "m1");
                assert_eq!(b.msg, "m2");
            }
            other => panic!("expected events, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn flush_all_drains_a_partial_batch() {
        let (engine, received) = engine_with_recorder(100);
        engine.process(event("svc", "only")).await;
        engine.flush_all().await;
        assert_eq!(received.lock().unwrap().len(), 1);
    }
}
