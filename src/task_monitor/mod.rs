use std::sync::Arc;
use std::time::Duration;

use anyhow::Result as AnyhowResult;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::app::App;
use crate::shutdown::Shutdown;
use crate::utils::spawn_with_backoff;

pub mod tasks;

const PROCESS_CLAIMS_BACKOFF: Duration = Duration::from_secs(5);
const WALLET_MONITOR_BACKOFF: Duration = Duration::from_secs(5);
const REFILL_WALLET_BACKOFF: Duration = Duration::from_secs(5);
const HUB_PINGER_BACKOFF: Duration = Duration::from_secs(5);

/// How often the refill controller is invoked; its own cooldowns decide
/// whether anything happens.
const REFILL_INTERVAL: Duration = Duration::from_secs(60);

struct RunningInstance {
    handles: Vec<JoinHandle<()>>,
    shutdown: Shutdown,
}

impl RunningInstance {
    async fn shutdown(self) -> AnyhowResult<()> {
        info!("Sending a shutdown signal to the settlement tasks.");
        self.shutdown.shutdown();

        info!("Awaiting tasks to shutdown.");
        for result in futures::future::join_all(self.handles).await {
            result?;
        }

        Ok(())
    }
}

/// Drives the settlement background work: the queue tick, the wallet
/// monitor, the refill timer and the notification keepalive.
///
/// Assumes a single instance per process; the pipeline's single-flight
/// guards protect against overlap within one instance, not across two.
pub struct TaskMonitor {
    /// The instance is kept behind an RwLock<Option<...>> because
    /// when shutdown is called we want to be able to gracefully
    /// await the join handles - which requires ownership of the handle and by
    /// extension the instance.
    instance: RwLock<Option<RunningInstance>>,
    app: Arc<App>,
}

impl TaskMonitor {
    pub fn new(app: Arc<App>) -> Self {
        Self {
            instance: RwLock::new(None),
            app,
        }
    }

    #[instrument(level = "debug", skip_all)]
    pub async fn start(&self, shutdown: Shutdown) {
        let mut instance = self.instance.write().await;
        if instance.is_some() {
            warn!("Settlement tasks already running");
            return;
        }

        let mut handles = Vec::new();

        // Queue drain tick
        let process_claims = {
            let pipeline = self.app.pipeline.clone();
            let tick_interval = self.app.config.claims.tick_interval;
            move || tasks::process_claims::process_claims(pipeline.clone(), tick_interval)
        };
        handles.push(spawn_with_backoff(
            process_claims,
            PROCESS_CLAIMS_BACKOFF,
            shutdown.clone(),
        ));

        // Wallet bring-up and periodic refresh
        let monitor_wallet = {
            let wallet = self.app.wallet.clone();
            let config = self.app.config.wallet.clone();
            move || tasks::monitor_wallet::monitor_wallet(wallet.clone(), config.clone())
        };
        handles.push(spawn_with_backoff(
            monitor_wallet,
            WALLET_MONITOR_BACKOFF,
            shutdown.clone(),
        ));

        // Treasury band controller
        let refill_wallet = {
            let refill = self.app.refill.clone();
            move || tasks::refill_wallet::refill_wallet(refill.clone(), REFILL_INTERVAL)
        };
        handles.push(spawn_with_backoff(
            refill_wallet,
            REFILL_WALLET_BACKOFF,
            shutdown.clone(),
        ));

        // Subscriber keepalive
        let hub_pinger = {
            let hub = self.app.hub.clone();
            move || hub.clone().run_pinger()
        };
        handles.push(spawn_with_backoff(
            hub_pinger,
            HUB_PINGER_BACKOFF,
            shutdown.clone(),
        ));

        *instance = Some(RunningInstance { handles, shutdown });
    }

    /// # Errors
    ///
    /// Will return an Error if the settlement tasks cannot be shut down
    /// gracefully.
    pub async fn shutdown(&self) -> AnyhowResult<()> {
        let mut instance = self.instance.write().await;
        if let Some(instance) = instance.take() {
            instance.shutdown().await?;
        } else {
            info!("Settlement tasks not running.");
        }
        Ok(())
    }
}
