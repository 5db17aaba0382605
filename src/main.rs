use portico::config::Config;
use portico::server;
use tracing::Level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load()?;

    let level: Level = cfg.server.log_level.parse().unwrap_or(Level::INFO);
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(level)
        .init();

    tracing::info!(
        workers = cfg.pool.worker_count,
        queue = cfg.pool.max_connections,
        idle_timeout_ms = cfg.connection.idle_timeout_ms,
        max_requests = cfg.connection.max_requests_per_connection,
        "Starting portico"
    );

    server::listener::run(&cfg).await
}
