// Background watchdog: notices local upstreams that exited on their own.
//
// Crashed upstreams are marked errored with their exit detail. Nothing is
// restarted; that stays an operator action.

use std::sync::Arc;
use std::time::Duration;
use switchboard_mcp::UpstreamManager;
use tokio::time::MissedTickBehavior;

pub const CHECK_INTERVAL: Duration = Duration::from_secs(5);

pub fn spawn(upstreams: Arc<UpstreamManager>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("watchdog: started (interval={}s)", interval.as_secs());

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let reaped = upstreams.reap_exited();
            if reaped.is_empty() {
                tracing::trace!("watchdog: all upstreams alive");
            } else {
                tracing::warn!(upstreams = ?reaped, "watchdog: upstreams exited, marked errored");
            }
        }
    })
}
