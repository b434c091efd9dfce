use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::worker::service::WorkerNode;

/// Periodically tells the masternode the worker is alive.
///
/// Heartbeats are flagged `first` until the masternode acknowledges one,
/// so a restarted worker gets its stale tasks redispatched exactly once.
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub async fn run(&self, node: Arc<WorkerNode>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        let mut first = true;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match node.send_heartbeat(first).await {
                Ok(accepted) => {
                    if !accepted {
                        tracing::warn!("Masternode could not reach this worker back");
                    }
                    first = false;
                }
                Err(e) => {
                    tracing::warn!(error = %e, first, "Masternode unreachable, retrying heartbeat");
                }
            }
        }
    }
}
