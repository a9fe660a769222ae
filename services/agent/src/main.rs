use std::env;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

/// Grace period given to open connections to drain once shutdown begins.
/// Not configurable; kept as a fixed constant rather than an extra TOML key.
const SHUTDOWN_GRACE_S: u64 = 5;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "agent starting");

    let config_path = env::args().nth(1).unwrap_or_else(|| "agent.toml".to_owned());
    let config = match agent::config::load_config_from_path(std::path::Path::new(&config_path)) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config '{config_path}': {e}");
            std::process::exit(1);
        }
    };

    let agent = match agent::Agent::build(config).await {
        Ok(a) => a,
        Err(e) => {
            eprintln!("FATAL: failed to bind listener: {e}");
            std::process::exit(2);
        }
    };
    info!(addr = ?agent.local_addr(), "agent ready");

    let shutdown = agent.shutdown_handle();
    let run = tokio::spawn(agent.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received Ctrl+C"),
        _ = wait_for_sigterm() => info!("received SIGTERM"),
    }

    info!(grace_s = SHUTDOWN_GRACE_S, "shutting down, no longer accepting connections");
    let _ = shutdown.send(true);
    if tokio::time::timeout(Duration::from_secs(SHUTDOWN_GRACE_S), run)
        .await
        .is_err()
    {
        info!("grace period elapsed before drain finished");
    }
    info!("shutdown complete");
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}
