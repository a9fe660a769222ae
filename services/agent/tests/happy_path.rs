//! A single event, flushed by the time trigger, lands as exactly one line
//! in the filesystem backend's daily file.

use agent::config::{
    AgentConfig, BackendEntry, BackendKind, BufferConfig, ListenerConfig, RoutingRule,
};
use jt_sdk::{EmitterConfig, Emitter};
use std::collections::BTreeMap;
use std::time::Duration;

fn config(base_path: &str, port: u16) -> AgentConfig {
    let mut backends = BTreeMap::new();
    backends.insert(
        "fs".to_owned(),
        BackendEntry {
            enabled: true,
            kind: BackendKind::Filesystem {
                base_path: base_path.to_owned(),
                rotate_size_mb: None,
            },
        },
    );
    let mut routing = BTreeMap::new();
    routing.insert(
        "default".to_owned(),
        vec![RoutingRule {
            backend_name: "fs".to_owned(),
            enabled: true,
            priority: 0,
            filter: None,
        }],
    );
    AgentConfig {
        listener: ListenerConfig {
            host: "127.0.0.1".to_owned(),
            port,
            max_connections: 10,
        },
        buffer: BufferConfig {
            flush_batch_size: 100,
            flush_interval_s: 1,
            per_source_max: 1000,
        },
        routing,
        backends,
        backend_cooldown_s: 30,
        router_batch_deadline_s: 30,
        ingest_max_skew_s: 600,
    }
}

#[tokio::test]
async fn a_single_event_is_flushed_to_the_filesystem_backend() {
    let dir = tempfile::tempdir().unwrap();
    let agent = agent::Agent::build(config(dir.path().to_str().unwrap(), 0))
        .await
        .unwrap();
    let addr = agent.local_addr().unwrap();
    let shutdown = agent.shutdown_handle();
    let run = tokio::spawn(agent.run());

    let emitter = Emitter::connect(EmitterConfig::new(addr.to_string(), "hello"));
    emitter.log_event(jt_protocol::Level::Info, "hi", None);

    let today = chrono::Utc::now().format("%Y-%m-%d");
    let path = dir.path().join(format!("hello-{today}.jsonl"));
    let mut contents = String::new();
    for _ in 0..50 {
        if let Ok(c) = tokio::fs::read_to_string(&path).await {
            contents = c;
            if !contents.is_empty() {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(contents.lines().count(), 1);
    let decoded = jt_protocol::decode(contents.lines().next().unwrap().as_bytes()).unwrap();
    assert_eq!(decoded.src, "hello");

    let _ = shutdown.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), run).await;
}
