//! The clock and the two maintenance windows.
//!
//! One task owns both periodic timers:
//! - every 10 minutes the oldest accepted response timestamp advances
//!   to `now − 60 s` and stale handled-response ids are reaped;
//! - every hour the subscription `since` is recomputed as `now − 48 h`,
//!   every subscription (initial and hint) is reopened with it, and
//!   handled-event ids older than it are reaped.

use crate::ingress::Ingress;
use hornet_client::RelayPool;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Grace added below "now" for slightly skewed response timestamps.
pub const RESPONSE_GRACE_SECS: u64 = 60;

/// How far in the future an inner timestamp may claim to be.
pub const FUTURE_DRIFT_SECS: u64 = 600;

/// Subscription lookback; also bounds the handled-event window.
pub const SUBSCRIPTION_LOOKBACK_SECS: u64 = 48 * 60 * 60;

const REAP_INTERVAL: Duration = Duration::from_secs(10 * 60);
const REWIND_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The `since` for a subscription opened right now.
pub fn subscription_since() -> u64 {
    unix_now().saturating_sub(SUBSCRIPTION_LOOKBACK_SECS)
}

/// Spawn the maintenance task; it stops when `shutdown` flips to true.
pub fn spawn(
    ingress: Arc<Ingress>,
    pool: Arc<RelayPool>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // Startup already primed the windows; first tick after one period.
        let start = tokio::time::Instant::now();
        let mut reap = tokio::time::interval_at(start + REAP_INTERVAL, REAP_INTERVAL);
        reap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut rewind = tokio::time::interval_at(start + REWIND_INTERVAL, REWIND_INTERVAL);
        rewind.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = reap.tick() => {
                    let oldest = unix_now().saturating_sub(RESPONSE_GRACE_SECS);
                    ingress.set_oldest_time(oldest);
                    ingress.reap_responses(oldest);
                    debug!(oldest, "advanced response window");
                }
                _ = rewind.tick() => {
                    let since = subscription_since();
                    pool.rewind(since).await;
                    ingress.reap_events(since);
                    debug!(since, "rewound subscriptions");
                }
            }
        }
        debug!("maintenance task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_since_is_48h_back() {
        let since = subscription_since();
        let now = unix_now();
        assert!(now - since >= SUBSCRIPTION_LOOKBACK_SECS);
        assert!(now - since < SUBSCRIPTION_LOOKBACK_SECS + 5);
    }
}
