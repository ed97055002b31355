//! Fixed-cadence gauge sampling across all registered accounts.

use std::sync::Arc;
use std::time::Duration;

use fxbridge_telemetry::BridgeMetrics;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::registry::AccountRegistry;

/// Sample equity, balance, margin and the open-order count for every
/// registered account on a fixed interval.
pub fn spawn_sampler(
    registry: Arc<AccountRegistry>,
    metrics: Arc<BridgeMetrics>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            for handle in registry.handles() {
                let info = handle.session.account();
                let open = match handle.session.open_orders().await {
                    Ok(orders) => orders.len(),
                    Err(err) => {
                        debug!(login = handle.login, %err, "open order fetch failed");
                        continue;
                    }
                };
                metrics.record(&info, open);
            }
        }
    })
}
