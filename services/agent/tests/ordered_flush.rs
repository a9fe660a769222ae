//! Three messages sent rapidly on one connection land in one batch and
//! reach the filesystem adapter in receive order.

use agent::config::{
    AgentConfig, BackendEntry, BackendKind, BufferConfig, ListenerConfig, RoutingRule,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

fn config(base_path: &str) -> AgentConfig {
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
            port: 0,
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
async fn three_rapid_messages_land_in_receive_order() {
    let dir = tempfile::tempdir().unwrap();
    let agent = agent::Agent::build(config(dir.path().to_str().unwrap()))
        .await
        .unwrap();
    let addr = agent.local_addr().unwrap();
    let shutdown = agent.shutdown_handle();
    let run = tokio::spawn(agent.run());

    let mut socket = TcpStream::connect(addr).await.unwrap();
    for i in 0..3 {
        let env = jt_test_utils::fixtures::event("ordered-src", jt_protocol::Level::Info, &format!("m{i}"));
        let bytes = jt_protocol::encode(&env).unwrap();
        socket.write_all(&bytes).await.unwrap();
    }
    socket.flush().await.unwrap();

    let today = chrono::Utc::now().format("%Y-%m-%d");
    let path = dir.path().join(format!("ordered-src-{today}.jsonl"));
    let mut lines: Vec<String> = Vec::new();
    for _ in 0..50 {
        if let Ok(contents) = tokio::fs::read_to_string(&path).await {
            lines = contents.lines().map(str::to_owned).collect();
            if lines.len() >= 3 {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(lines.len(), 3);
    for (i, line) in lines.iter().enumerate() {
        let env = jt_protocol::decode(line.as_bytes()).unwrap();
        match env.payload {
            jt_protocol::Payload::Event(p) => assert_eq!(p.msg, format!("m{i}")),
            other => panic!("expected event payload, got {other:?}"),
        }
    }

    drop(socket);
    let _ = shutdown.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), run).await;
}
