//! Periodic overflow resolution.

use super::MatrixService;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Retry every pending overflow entry on a fixed period. Also drains any
/// journal backlog left by an earlier write failure.
pub fn spawn_overflow_sweeper(service: MatrixService, every: Duration) -> JoinHandle<()> {
    info!(period_secs = every.as_secs(), "Starting overflow sweeper");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = service.resolve_all_pending().await {
                warn!(error = %e, "Overflow sweep failed");
            }
            if !service.is_durable().await {
                if let Err(e) = service.flush().await {
                    warn!(error = %e, "Journal backlog still pending");
                }
            }
        }
    })
}
