//! Explicit `Agent` object wiring the listener, correlation engine, router,
//! and backend map together instead of relying on global singletons.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::backend::{BackendAdapter, FilesystemBackend, ManagedBackend, ObjectStoreBackend, SearchIndexBackend};
use crate::config::{AgentConfig, BackendKind};
use crate::correlation::CorrelationEngine;
use crate::error::AgentError;
use crate::listener::StreamListener;
use crate::router::Router;

pub struct Agent {
    listener: StreamListener,
    correlation: Arc<CorrelationEngine>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Agent {
    pub async fn build(config: AgentConfig) -> Result<Self, AgentError> {
        let mut backends: BTreeMap<String, Arc<dyn BackendAdapter>> = BTreeMap::new();
        for (name, entry) in &config.backends {
            if !entry.enabled {
                continue;
            }
            let adapter = build_backend(&entry.kind, config.ingest_max_skew_s).await;
            if let Err(e) = adapter.init().await {
                warn!(backend = %name, error = %e, "backend failed to initialize");
            }
            backends.insert(name.clone(), adapter);
        }

        let router = Arc::new(Router::new(
            config.routing.clone(),
            backends,
            Duration::from_secs(config.backend_cooldown_s),
            Duration::from_secs(config.router_batch_deadline_s),
        ));
        let correlation = Arc::new(CorrelationEngine::new(config.buffer.clone(), router));
        correlation.spawn_time_flush().await;

        let listener = StreamListener::bind(&config.listener).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Agent {
            listener,
            correlation,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept loop until `shutdown()` is called, then flushes every
    /// buffer unconditionally.
    pub async fn run(self) {
        self.listener.run(self.correlation.clone(), self.shutdown_rx).await;
        info!("accept loop stopped, flushing remaining buffers");
        self.correlation.flush_all().await;
    }

    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }
}

async fn build_backend(kind: &BackendKind, ingest_max_skew_s: i64) -> Arc<dyn BackendAdapter> {
    match kind {
        BackendKind::Managed { database_url } => match ingest::db::create_pool(database_url).await {
            Ok(pool) => {
                if let Err(e) = ingest::db::run_migrations(&pool).await {
                    warn!(error = %e, "managed backend migration failed");
                }
                Arc::new(ManagedBackend::new(ingest::IngestWriter::new(pool, ingest_max_skew_s)))
            }
            Err(e) => {
                warn!(error = %e, "managed backend failed to connect, spooling to disk instead");
                Arc::new(FilesystemBackend::new("/tmp/jt-agent-fallback", None))
            }
        },
        BackendKind::Filesystem { base_path, rotate_size_mb } => {
            Arc::new(FilesystemBackend::new(base_path.clone(), *rotate_size_mb))
        }
        BackendKind::ObjectStore { endpoint, bucket, batch_size } => {
            Arc::new(ObjectStoreBackend::new(endpoint.clone(), bucket.clone(), *batch_size))
        }
        BackendKind::SearchIndex { endpoint, index } => {
            Arc::new(SearchIndexBackend::new(endpoint.clone(), index.clone()))
        }
    }
}
