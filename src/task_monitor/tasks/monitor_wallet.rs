use std::sync::Arc;

use tokio::time::sleep;
use tracing::warn;

use crate::config::WalletConfig;
use crate::wallet::WalletManager;

/// Brings the wallet up and keeps its snapshot fresh.
///
/// Initialization failures retry on a fixed delay; because this is the
/// only task driving the wallet, retries cannot accumulate. A reload
/// signal tears the clients down and runs the same bring-up path again.
pub async fn monitor_wallet(wallet: Arc<WalletManager>, config: WalletConfig) -> anyhow::Result<()> {
    loop {
        while let Err(err) = wallet.try_initialize().await {
            warn!(%err, "Wallet initialization failed, retrying");
            sleep(config.init_retry_interval).await;
        }

        loop {
            tokio::select! {
                () = sleep(config.refresh_interval) => {
                    // A failed refresh publishes not-ready and is retried
                    // on the next interval with the same clients.
                    wallet.load_wallet_state().await;
                }
                () = wallet.reload_signalled() => {
                    wallet.begin_reload();
                    break;
                }
            }
        }
    }
}
