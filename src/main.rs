mod api;
mod config;
mod crawler;
mod db;
mod error;
mod fanout;
mod listener;
mod manager;
mod rpc;
mod timefmt;
mod types;

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::routes::{router, ApiState};
use crate::config::Config;
use crate::crawler::Crawler;
use crate::error::Result;
use crate::fanout::Hub;
use crate::listener::Listener;
use crate::manager::ConnectionManager;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Connections: database, HTTP RPC failover, streaming supervisor ---
    let manager = ConnectionManager::connect(cfg.clone()).await?;
    info!("archiving contract {}", cfg.contract_address);

    // --- Historical crawler: backfill + repair passes ---
    let crawler = Crawler::new(Arc::clone(&manager));
    crawler.start();

    // --- Realtime listener + push fan-out ---
    let hub = Arc::new(Hub::new());
    let listener = Listener::new(Arc::clone(&manager), Arc::clone(&hub));
    let listener_task = Arc::clone(&listener);
    tokio::spawn(async move { listener_task.run().await });

    // --- HTTP API server ---
    let api_state = ApiState {
        manager: Arc::clone(&manager),
        crawler,
        listener,
        hub,
    };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let tcp = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(tcp, app).await?;

    manager.close().await;
    Ok(())
}
