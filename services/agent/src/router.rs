//! Routing Engine: per-source rule lookup, filter application,
//! concurrent fan-out, and a per-backend circuit breaker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use jt_protocol::Envelope;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::backend::BackendAdapter;
use crate::config::RoutingRule;

const DEGRADE_THRESHOLD: u32 = 3;
const OPEN_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Healthy,
    Degraded,
    Open,
    /// `Open` past cooldown: the next send is the single allowed probe.
    HalfOpen,
}

struct BreakerEntry {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl BreakerEntry {
    fn new() -> Self {
        BreakerEntry {
            state: BreakerState::Healthy,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

struct Breaker {
    entry: Mutex<BreakerEntry>,
    cooldown: Duration,
}

impl Breaker {
    fn new(cooldown: Duration) -> Self {
        Breaker {
            entry: Mutex::new(BreakerEntry::new()),
            cooldown,
        }
    }

    /// Returns `true` if a send to this backend may proceed right now.
    async fn admit(&self, backend_name: &str) -> bool {
        let mut e = self.entry.lock().await;
        match e.state {
            BreakerState::Healthy | BreakerState::Degraded => true,
            BreakerState::Open => {
                let elapsed = e.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.cooldown {
                    e.state = BreakerState::HalfOpen;
                    info!(backend = backend_name, "breaker entering half-open probe");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => false, // a probe is already in flight
        }
    }

    async fn record(&self, backend_name: &str, ok: bool) {
        let mut e = self.entry.lock().await;
        if ok {
            if e.state != BreakerState::Healthy {
                info!(backend = backend_name, "breaker closing, backend recovered");
            }
            e.state = BreakerState::Healthy;
            e.consecutive_failures = 0;
            e.opened_at = None;
            return;
        }

        e.consecutive_failures += 1;
        if e.consecutive_failures >= OPEN_THRESHOLD {
            if e.state != BreakerState::Open {
                warn!(backend = backend_name, failures = e.consecutive_failures, "breaker opening");
            }
            e.state = BreakerState::Open;
            e.opened_at = Some(Instant::now());
        } else if e.consecutive_failures >= DEGRADE_THRESHOLD {
            e.state = BreakerState::Degraded;
        }
    }

    async fn state(&self) -> BreakerState {
        self.entry.lock().await.state
    }
}

pub struct Router {
    routing: BTreeMap<String, Vec<RoutingRule>>,
    backends: BTreeMap<String, Arc<dyn BackendAdapter>>,
    breakers: BTreeMap<String, Breaker>,
    batch_deadline: Duration,
}

impl Router {
    pub fn new(
        routing: BTreeMap<String, Vec<RoutingRule>>,
        backends: BTreeMap<String, Arc<dyn BackendAdapter>>,
        cooldown: Duration,
        batch_deadline: Duration,
    ) -> Self {
        let breakers = backends
            .keys()
            .map(|name| (name.clone(), Breaker::new(cooldown)))
            .collect();
        Router {
            routing,
            backends,
            breakers,
            batch_deadline,
        }
    }

    pub async fn breaker_state(&self, backend_name: &str) -> Option<BreakerState> {
        match self.breakers.get(backend_name) {
            Some(b) => Some(b.state().await),
            None => None,
        }
    }

    /// Routes one flushed batch for `source`: looks up its rules (falling
    /// back to `"default"`), fans out concurrently to every admitted
    /// backend, and folds results into each backend's breaker.
    pub async fn route_batch(&self, source: &str, messages: Vec<Envelope>) {
        let rules = match self.routing.get(source).or_else(|| self.routing.get("default")) {
            Some(rules) => rules,
            None => {
                warn!(source, "no routing rule and no default, dropping batch");
                return;
            }
        };

        let mut submissions = Vec::new();
        for rule in rules {
            if !rule.enabled {
                continue;
            }
            let Some(backend) = self.backends.get(&rule.backend_name) else {
                warn!(backend = %rule.backend_name, "routing rule references unconfigured backend");
                continue;
            };
            let Some(breaker) = self.breakers.get(&rule.backend_name) else {
                continue;
            };
            if !breaker.admit(&rule.backend_name).await {
                continue;
            }

            let filtered: Vec<Envelope> = match &rule.filter {
                Some(types) => messages
                    .iter()
                    .filter(|m| types.contains(m.type_name()))
                    .cloned()
                    .collect(),
                None => messages.clone(),
            };
            if filtered.is_empty() {
                continue;
            }

            submissions.push(self.send_to(&rule.backend_name, backend.clone(), filtered));
        }

        let deadline = self.batch_deadline;
        let _ = tokio::time::timeout(deadline, join_all(submissions)).await;
    }

    async fn send_to(&self, name: &str, backend: Arc<dyn BackendAdapter>, messages: Vec<Envelope>) {
        let result = backend.send_batch(&messages).await;
        if let Some(breaker) = self.breakers.get(name) {
            breaker.record(name, result.ok).await;
        }
        if !result.ok {
            warn!(backend = name, error = ?result.error, failed = result.count_failed, "batch send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SendResult;
    use async_trait::async_trait;
    use jt_protocol::{EventPayload, Level, Payload};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AlwaysFail {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BackendAdapter for AlwaysFail {
        async fn init(&self) -> Result<(), crate::error::BackendError> {
            Ok(())
        }
        async fn send_batch(&self, messages: &[Envelope]) -> SendResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            SendResult::failed(messages.len(), "boom", Duration::ZERO)
        }
        async fn health(&self) -> bool {
            false
        }
        async fn close(&self) {}
    }

    struct AlwaysOk {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BackendAdapter for AlwaysOk {
        async fn init(&self) -> Result<(), crate::error::BackendError> {
            Ok(())
        }
        async fn send_batch(&self, messages: &[Envelope]) -> SendResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            SendResult::all_sent(messages.len(), Duration::ZERO)
        }
        async fn health(&self) -> bool {
            true
        }
        async fn close(&self) {}
    }

    fn event() -> Envelope {
        Envelope::new(
            "svc",
            jt_protocol::now_millis(),
            Payload::Event(EventPayload {
                level: Level::Info,
                msg: "x".to_owned(),
                ctx: None,
            }),
        )
    }

    fn default_routing(names: &[&str]) -> BTreeMap<String, Vec<RoutingRule>> {
        let mut routing = BTreeMap::new();
        routing.insert(
            "default".to_owned(),
            names
                .iter()
                .map(|n| RoutingRule {
                    backend_name: n.to_string(),
                    enabled: true,
                    priority: 0,
                    filter: None,
                })
                .collect(),
        );
        routing
    }

    #[tokio::test]
    async fn breaker_opens_after_five_consecutive_failures_and_spares_the_other_backend() {
        let a_calls = Arc::new(AtomicUsize::new(0));
        let b_calls = Arc::new(AtomicUsize::new(0));
        let mut backends: BTreeMap<String, Arc<dyn BackendAdapter>> = BTreeMap::new();
        backends.insert("a".to_owned(), Arc::new(AlwaysFail { calls: a_calls.clone() }));
        backends.insert("b".to_owned(), Arc::new(AlwaysOk { calls: b_calls.clone() }));

        let router = Router::new(
            default_routing(&["a", "b"]),
            backends,
            Duration::from_secs(3600),
            Duration::from_secs(5),
        );

        for _ in 0..5 {
            router.route_batch("svc", vec![event()]).await;
        }
        assert_eq!(router.breaker_state("a").await, Some(BreakerState::Open));
        assert_eq!(a_calls.load(Ordering::SeqCst), 5);
        assert_eq!(b_calls.load(Ordering::SeqCst), 5);

        for _ in 0..10 {
            router.route_batch("svc", vec![event()]).await;
        }
        assert_eq!(a_calls.load(Ordering::SeqCst), 5, "open breaker must not receive traffic");
        assert_eq!(b_calls.load(Ordering::SeqCst), 15);
    }

    #[tokio::test]
    async fn half_open_allows_exactly_one_probe_after_cooldown() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut backends: BTreeMap<String, Arc<dyn BackendAdapter>> = BTreeMap::new();
        backends.insert("a".to_owned(), Arc::new(AlwaysFail { calls: calls.clone() }));

        let router = Router::new(
            default_routing(&["a"]),
            backends,
            Duration::from_millis(50),
            Duration::from_secs(5),
        );
        for _ in 0..5 {
            router.route_batch("svc", vec![event()]).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        tokio::time::sleep(Duration::from_millis(80)).await;
        router.route_batch("svc", vec![event()]).await;
        assert_eq!(calls.load(Ordering::SeqCst), 6, "cooldown elapsed, exactly one probe expected");
    }

    #[tokio::test]
    async fn unrouted_source_with_no_default_drops_the_batch() {
        let backends: BTreeMap<String, Arc<dyn BackendAdapter>> = BTreeMap::new();
        let router = Router::new(BTreeMap::new(), backends, Duration::from_secs(1), Duration::from_secs(1));
        router.route_batch("svc", vec![event()]).await; // must not panic
    }
}
