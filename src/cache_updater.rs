//! Background refresh loop for the pod map.
//!
//! Scrapes refresh a stale map on their own; the poller keeps it warm so a
//! scrape rarely has to wait for the container runtime.

use kubevirt_metrics_collector::{FindError, RefreshCache};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Refreshes `cache` every `period`. With `auto_track` a failed refresh is
/// logged and the loop keeps going; without it the first failure ends the
/// loop and is returned.
pub async fn run_poller(
    cache: Arc<RefreshCache>,
    period: Duration,
    auto_track: bool,
) -> Result<(), FindError> {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; startup already did a refresh.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match cache.update().await {
            Ok(pods) => debug!("Poller refreshed pod map: {} domains", pods.len()),
            Err(e) if auto_track => warn!("Pod map refresh failed, will retry: {}", e),
            Err(e) => return Err(e),
        }
    }
}
