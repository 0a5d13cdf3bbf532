use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use cronhooks_core::config::CronhooksConfig;
use cronhooks_scheduler::{
    DispatchGateway, Executor, LocalQueue, QueueEngine, ReqwestCaller, SqliteStore,
    WebhookScheduler, WebhookStore,
};
use rusqlite::Connection;
use tracing::info;

mod app;
mod http;

#[derive(Debug, Parser)]
#[command(name = "cronhooks-gateway", version, about = "Scheduled webhook service")]
struct Cli {
    /// Path to cronhooks.toml (defaults to ~/.cronhooks/cronhooks.toml).
    #[arg(long, env = "CRONHOOKS_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cronhooks_gateway=info,cronhooks_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let config = CronhooksConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        CronhooksConfig::default()
    });

    let db_path = config.database.path.clone();
    ensure_parent_dir(&db_path);
    info!(path = %db_path, "opening SQLite database");

    // store and queue each get their own connection to the same file
    let store: Arc<dyn WebhookStore> = Arc::new(SqliteStore::new(open_db(&db_path)?)?);
    let queue = Arc::new(LocalQueue::new(open_db(&db_path)?)?);
    let gateway: Arc<dyn DispatchGateway> = queue.clone();
    info!("database migrations complete");

    let caller = Arc::new(ReqwestCaller::new()?);
    let executor = Arc::new(Executor::new(store.clone(), gateway.clone(), caller));
    let scheduler = WebhookScheduler::new(store, gateway);

    let engine = QueueEngine::new(
        queue,
        executor,
        config.queue.workers,
        Duration::from_millis(config.queue.poll_interval_ms),
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine_task = tokio::spawn(engine.run(shutdown_rx));

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let state = Arc::new(app::AppState::new(config, scheduler));
    let router = app::build_router(state);

    info!("CronHooks gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("failed to listen for ctrl-c: {e}");
            }
        })
        .await?;

    // stop claiming new work, then let in-flight attempts finish
    let _ = shutdown_tx.send(true);
    if let Err(e) = engine_task.await {
        tracing::warn!("queue engine task ended abnormally: {e}");
    }
    info!("shutdown complete");
    Ok(())
}

fn open_db(path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
