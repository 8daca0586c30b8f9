//! ingest-core: real-time multi-exchange market-data ingest pipeline.

use std::sync::Arc;

use ingest_core::config::load_config;
use ingest_core::runtime::Runtime;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();
    log::info!("ingest-core starting");

    let config_path = std::env::var("INGEST_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let config = match load_config(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("fatal config error: {e}");
            std::process::exit(1);
        }
    };

    log::info!(
        "enabled venues: {:?}",
        config.enabled_venues().iter().map(|v| v.to_string()).collect::<Vec<_>>()
    );

    let runtime = Arc::new(Runtime::new(config));
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

    let runtime_handle = tokio::spawn(runtime.run(shutdown_rx));

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("failed to listen for shutdown signal: {e}");
    }
    log::info!("received interrupt, shutting down");
    let _ = shutdown_tx.send(()).await;

    if let Err(e) = runtime_handle.await {
        log::error!("runtime task panicked: {e}");
    }
}
