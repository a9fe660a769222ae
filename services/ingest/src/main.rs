use std::env;

use tracing::info;
use tracing_subscriber::EnvFilter;

/// Standalone runner for the managed write path, for deployments that want
/// the ingest endpoint outside the agent process. It does nothing but apply
/// migrations and idle — the real entry point for most deployments is
/// `agent`'s in-process `ManagedBackend`.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let max_skew_s: i64 = env::var("INGEST_MAX_SKEW_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(600);

    info!("connecting to database...");
    let pool = match ingest::db::create_pool(&database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("FATAL: failed to connect to database: {e}");
            std::process::exit(2);
        }
    };
    if let Err(e) = ingest::db::run_migrations(&pool).await {
        eprintln!("FATAL: failed to run migrations: {e}");
        std::process::exit(1);
    }
    info!("migrations applied");

    let _writer = ingest::IngestWriter::new(pool, max_skew_s);
    info!(max_skew_s, "ingest write path ready");

    tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    info!("received Ctrl+C, shutting down");
}
