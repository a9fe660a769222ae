//! jt-sdk: a synchronous, thread-safe emitter for job-telemetry.
//!
//! Applications call the `log_*`/`start_span`/`end_span` methods from any
//! thread without blocking; a background thread owns the socket, a bounded
//! ring buffer, and the reconnect state machine. Nothing here ever panics
//! or raises into application code — failures degrade to a dropped message
//! and an incremented counter.

mod connection;
mod error;
mod span;

pub use error::EmitterError;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use jt_protocol::{Envelope, EventPayload, Level, MetricPayload, Payload, ProgressPayload,
    ResourcePayload, SpanPayload};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::warn;
use uuid::Uuid;

pub use span::SpanGuard;

/// Upper bound on the in-memory ring; matches `sdk.buffer_max` in the agent's
/// configuration table so both sides agree on the default.
pub const DEFAULT_BUFFER_MAX: usize = 1000;

/// Ceiling for the exponential reconnect backoff, in seconds.
pub const DEFAULT_RECONNECT_MAX_S: u64 = 30;

#[derive(Debug, Clone)]
pub struct EmitterConfig {
    /// `host:port` of the agent's listener.
    pub addr: String,
    /// This process's logical source name, sent as `src` on every envelope.
    pub src: String,
    pub buffer_max: usize,
    pub reconnect_max_s: u64,
}

impl EmitterConfig {
    pub fn new(addr: impl Into<String>, src: impl Into<String>) -> Self {
        EmitterConfig {
            addr: addr.into(),
            src: src.into(),
            buffer_max: DEFAULT_BUFFER_MAX,
            reconnect_max_s: DEFAULT_RECONNECT_MAX_S,
        }
    }
}

/// Coarse connectivity status, mirroring the `DISCONNECTED / CONNECTED /
/// OVERFLOW` state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connected,
    Overflow,
}

#[derive(Debug, Clone, Copy)]
pub struct EmitterStats {
    pub state: ConnState,
    pub buffer_size: usize,
    pub dropped: u64,
}

pub(crate) struct Shared {
    pub(crate) config: EmitterConfig,
    pub(crate) state: Mutex<State>,
    /// Signalled whenever the ring gains an entry or a shutdown is requested,
    /// so the background thread doesn't have to busy-poll.
    pub(crate) wake: Notify,
}

pub(crate) struct State {
    pub(crate) ring: std::collections::VecDeque<Envelope>,
    pub(crate) conn_state: ConnState,
    pub(crate) dropped: u64,
    pub(crate) trace_id: Option<String>,
    pub(crate) context: BTreeMap<String, Value>,
    pub(crate) current_span: Option<String>,
    pub(crate) closing: bool,
    pub(crate) closed: bool,
}

/// The public handle. Cloning is cheap (an `Arc` bump); all clones share the
/// same buffer, socket, and background thread.
#[derive(Clone)]
pub struct Emitter {
    shared: Arc<Shared>,
}

impl Emitter {
    /// Spawn the background connection thread and return immediately.
    pub fn connect(config: EmitterConfig) -> Self {
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(State {
                ring: std::collections::VecDeque::new(),
                conn_state: ConnState::Disconnected,
                dropped: 0,
                trace_id: None,
                context: BTreeMap::new(),
                current_span: None,
                closing: false,
                closed: false,
            }),
            wake: Notify::new(),
        });
        let worker_shared = shared.clone();
        // The handle is intentionally dropped rather than joined: the
        // background thread outlives any one `Emitter` clone and exits on
        // its own once `close()` drains the ring.
        let _: JoinHandle<()> = std::thread::Builder::new()
            .name("jt-sdk-emitter".into())
            .spawn(move || connection::run(worker_shared))
            .expect("failed to spawn jt-sdk background thread");
        Emitter { shared }
    }

    pub fn stats(&self) -> EmitterStats {
        let state = self.shared.state.lock().unwrap();
        EmitterStats {
            state: state.conn_state,
            buffer_size: state.ring.len(),
            dropped: state.dropped,
        }
    }

    pub fn set_trace_id(&self, id: impl Into<String>) {
        let mut state = self.shared.state.lock().unwrap();
        state.trace_id = Some(id.into());
    }

    pub fn set_context(&self, key: impl Into<String>, value: Value) {
        let mut state = self.shared.state.lock().unwrap();
        state.context.insert(key.into(), value);
    }

    pub fn log_event(&self, level: Level, msg: impl Into<String>, ctx: Option<Value>) -> bool {
        let ctx = self.merge_context(ctx);
        self.enqueue(Payload::Event(EventPayload {
            level,
            msg: msg.into(),
            ctx,
        }))
    }

    pub fn log_metric(
        &self,
        name: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
        tags: Option<Value>,
    ) -> bool {
        self.enqueue(Payload::Metric(MetricPayload {
            name: name.into(),
            value,
            unit: unit.into(),
            tags: as_map(tags),
        }))
    }

    pub fn log_progress(
        &self,
        job_id: impl Into<String>,
        percent: i32,
        status: impl Into<String>,
    ) -> bool {
        self.enqueue(Payload::Progress(ProgressPayload {
            job_id: job_id.into(),
            percent,
            status: status.into(),
        }))
    }

    pub fn log_resource(&self, cpu: f64, mem: f64, disk: f64, net: f64) -> bool {
        self.enqueue(Payload::Resource(ResourcePayload { cpu, mem, disk, net }))
    }

    /// Open a new span, returning its id. If `trace_id` is not given, one is
    /// minted lazily (or the emitter's previously set trace id is reused).
    pub fn start_span(&self, name: impl Into<String>, trace_id: Option<String>) -> String {
        let span_id = random_id();
        let (tid, parent) = {
            let mut state = self.shared.state.lock().unwrap();
            let tid = trace_id.unwrap_or_else(|| {
                state
                    .trace_id
                    .get_or_insert_with(random_id)
                    .clone()
            });
            let parent = state.current_span.replace(span_id.clone());
            (tid, parent)
        };
        let now = jt_protocol::now_millis();
        let env = self.build_envelope(
            now,
            Payload::Span(SpanPayload {
                name: name.into(),
                start: now,
                end: None,
                status: "open".to_owned(),
                tags: None,
            }),
        );
        let mut env = env;
        env.tid = Some(tid);
        env.sid = Some(span_id.clone());
        env.pid = parent;
        self.push(env);
        span_id
    }

    pub fn end_span(&self, span_id: &str, status: impl Into<String>, tags: Option<Value>) -> bool {
        let tid = {
            let mut state = self.shared.state.lock().unwrap();
            if state.current_span.as_deref() == Some(span_id) {
                state.current_span = None;
            }
            state.trace_id.clone().unwrap_or_default()
        };
        let now = jt_protocol::now_millis();
        let mut env = self.build_envelope(
            now,
            Payload::Span(SpanPayload {
                name: String::new(),
                start: now,
                end: Some(now),
                status: status.into(),
                tags: as_map(tags),
            }),
        );
        env.tid = Some(tid);
        env.sid = Some(span_id.to_owned());
        self.push(env)
    }

    /// Returns a guard that calls `end_span("ok", None)` on drop, covering
    /// early returns and panics in the caller's scope.
    pub fn scoped_span(&self, name: impl Into<String>, trace_id: Option<String>) -> SpanGuard<'_> {
        let span_id = self.start_span(name, trace_id);
        SpanGuard::new(self, span_id)
    }

    /// Drains best-effort, sends a `goodbye`, and stops the background
    /// thread. Safe to call more than once or from `Drop`.
    pub fn close(&self) -> bool {
        let now = jt_protocol::now_millis();
        let env = self.build_envelope(now, Payload::Goodbye);
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closing {
                return true;
            }
            state.closing = true;
            if state.ring.len() >= self.shared.config.buffer_max {
                state.ring.pop_front();
            } else {
                // goodbye is best-effort; if it would overflow, drop silently
                // rather than evicting a real message to make room.
            }
            if state.ring.len() < self.shared.config.buffer_max {
                state.ring.push_back(env);
            }
        }
        self.shared.wake.notify_waiters();
        true
    }

    fn merge_context(&self, extra: Option<Value>) -> Option<BTreeMap<String, Value>> {
        let state = self.shared.state.lock().unwrap();
        if state.context.is_empty() && extra.is_none() {
            return None;
        }
        let mut merged = state.context.clone();
        if let Some(Value::Object(obj)) = extra {
            for (k, v) in obj {
                merged.insert(k, v);
            }
        }
        Some(merged)
    }

    fn build_envelope(&self, ts: i64, payload: Payload) -> Envelope {
        Envelope::new(self.shared.config.src.clone(), ts, payload)
    }

    fn enqueue(&self, payload: Payload) -> bool {
        let now = jt_protocol::now_millis();
        let mut env = self.build_envelope(now, payload);
        {
            let state = self.shared.state.lock().unwrap();
            if let Some(span) = &state.current_span {
                env.sid = Some(span.clone());
            }
            if let Some(tid) = &state.trace_id {
                env.tid = Some(tid.clone());
            }
        }
        self.push(env)
    }

    fn push(&self, env: Envelope) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if state.closed {
            return false;
        }
        let was_full = state.ring.len() >= self.shared.config.buffer_max;
        if was_full {
            state.ring.pop_front();
            state.dropped += 1;
            state.conn_state = ConnState::Overflow;
            warn!(dropped_total = state.dropped, "emitter ring buffer full, dropping oldest message");
        }
        state.ring.push_back(env);
        drop(state);
        self.shared.wake.notify_waiters();
        !was_full
    }
}

fn as_map(value: Option<Value>) -> Option<BTreeMap<String, Value>> {
    match value {
        Some(Value::Object(obj)) => Some(obj.into_iter().collect()),
        _ => None,
    }
}

fn random_id() -> String {
    Uuid::new_v4().simple().to_string()
}
