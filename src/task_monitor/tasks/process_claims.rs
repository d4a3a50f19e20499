use std::sync::Arc;
use std::time::Duration;

use crate::claims::pipeline::ClaimPipeline;

/// Drives the pipeline's drain tick. The tick itself is single-flight, so
/// a slow tick makes the next interval firing a no-op instead of piling
/// up.
pub async fn process_claims(
    pipeline: Arc<ClaimPipeline>,
    tick_interval: Duration,
) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        pipeline.tick().await;
    }
}
