use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::refill::RefillController;

/// Invokes the refill controller on a timer; the controller's cooldowns
/// and band checks decide whether a treasury transaction goes out.
pub async fn refill_wallet(
    refill: Arc<RefillController>,
    interval: Duration,
) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if let Err(err) = refill.maybe_refill().await {
            warn!(%err, "Refill evaluation failed");
        }
    }
}
