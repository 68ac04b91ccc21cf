use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use crate_courier_server::broadcast::{join_ticker, BroadcastHub};
use crate_courier_server::config::ServerConfig;
use crate_courier_server::crate_store::{CrateStore, JsonFileCrateStore, MemoryCrateStore};
use crate_courier_server::game_service::GameService;
use crate_courier_server::gateway::{router, AppState};
use crate_courier_server::player_registry::PlayerRegistry;
use crate_courier_server::spawn::seed_store;
use tower_http::services::{ServeDir, ServeFile};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();
    init_tracing(&config.log_level);

    let store: Arc<dyn CrateStore> = match config.crate_db_path.as_ref() {
        Some(path) => {
            info!(path = %path.display(), "using file crate store");
            Arc::new(JsonFileCrateStore::open(path.clone()))
        }
        None => Arc::new(MemoryCrateStore::default()),
    };
    seed_store(
        store.as_ref(),
        config.crate_count,
        &config.zone,
        config.seed,
        config.reset,
    );

    let service = Arc::new(GameService::new(
        store,
        Arc::new(PlayerRegistry::new()),
        config.zone,
    ));
    let hub = Arc::new(BroadcastHub::default());
    let ticker = hub.spawn_ticker(service.clone(), config.tick_interval());

    let app = router(AppState::new(service, hub.clone()));
    let app = if let Some(static_dir) = config.resolve_static_dir() {
        info!(path = %static_dir.display(), "serving static client");
        let index_file = static_dir.join("index.html");
        app.fallback_service(ServeDir::new(static_dir).not_found_service(ServeFile::new(index_file)))
    } else {
        app
    };

    let bind_addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(
        addr = %bind_addr,
        zone = %config.zone,
        tick_ms = config.tick_ms,
        "listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub.clone()))
        .await
        .context("server runtime failed")?;

    join_ticker(ticker).await;
    info!("server stopped");
    Ok(())
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal(hub: Arc<BroadcastHub>) {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
    hub.shutdown();
}
