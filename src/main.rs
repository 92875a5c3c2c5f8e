use std::sync::Arc;
use tasktree::server::{self, db::TaskTable, AppState, SharedState};
use tasktree::Config;

fn init_tracing() {
    #[cfg(feature = "console")]
    {
        console_subscriber::init();
    }

    #[cfg(not(feature = "console"))]
    {
        use tracing_subscriber::EnvFilter;
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    // ── Config ─────────────────────────────────────────────────
    let config = Config::load()?;

    // ── Storage ────────────────────────────────────────────────
    let tasks = TaskTable::open(&config.server.database)?;
    let count = tasks.list(None)?.len();
    tracing::info!(database = %config.server.database.display(), tasks = count, "database opened");

    // ── Shared state ───────────────────────────────────────────
    let state: SharedState = Arc::new(AppState { tasks });

    // ── Start ──────────────────────────────────────────────────
    let (addr, serve) = server::bind(&config.server.bind, state).await?;
    tracing::info!(%addr, "tasktree server listening");
    tracing::info!("  Health: GET http://{addr}/api/health");
    tracing::info!("  Tasks:  GET http://{addr}/api/tasks");

    serve.await?;
    Ok(())
}
