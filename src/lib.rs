pub mod app;
pub mod chain;
pub mod claims;
pub mod config;
pub mod database;
pub mod notifications;
pub mod refill;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod status;
pub mod task_monitor;
pub mod utils;
pub mod wallet;

#[cfg(test)]
mod test_utils;

use std::sync::Arc;

use tracing::info;

use crate::app::App;
use crate::config::Config;
use crate::shutdown::Shutdown;
use crate::task_monitor::TaskMonitor;

/// Brings the service up and blocks until shutdown: restores persisted
/// claims, starts the settlement tasks and serves the API.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let shutdown = Shutdown::spawn(config.app.shutdown_timeout, config.app.shutdown_delay);

    let app = App::new(config.clone()).await?;
    app.restore().await?;

    let task_monitor = Arc::new(TaskMonitor::new(app.clone()));
    task_monitor.start(shutdown.clone()).await;

    server::run(app.clone(), config.server.clone(), shutdown.clone()).await?;

    info!("Server stopped, shutting down settlement tasks");
    app.pipeline.dispose();

    tokio::time::sleep(shutdown.delay()).await;
    tokio::time::timeout(shutdown.timeout(), task_monitor.shutdown()).await??;

    Ok(())
}
