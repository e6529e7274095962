//! Hub-wide heartbeat loop.

use std::sync::Weak;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::hub::EventHub;

/// Sweep the hub every `interval` until cancelled or the hub is dropped.
///
/// The first sweep happens one full interval after start.
pub async fn run_heartbeat(hub: Weak<EventHub>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(hub) = hub.upgrade() else { break };
                let pruned = hub.heartbeat_tick();
                debug!(pruned, connections = hub.connection_count(), "heartbeat sweep");
            }
            () = cancel.cancelled() => break,
        }
    }
}
