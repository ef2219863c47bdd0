pub mod config;
pub mod observer;
pub mod persistence;
pub mod server;
pub mod statistics;

use std::sync::Arc;

use config::Config;
use observer::Observer;
use statistics::Statistics;

/// Opens a function to replace `main` so integration tests can start the
/// router directly against the `lonip-router` library crate.
pub async fn server_main(config: Arc<Config>) -> anyhow::Result<()> {
    let observer = Arc::new(Observer::new());
    let statistics = Statistics::default();
    let workers = server::run(config, statistics, observer).await?;

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown signal received");
    workers.shutdown().await;
    Ok(())
}
