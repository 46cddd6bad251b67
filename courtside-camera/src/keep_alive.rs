//! Per-transfer keep-alive task.
//!
//! The cameras fall asleep mid-transfer without a periodic liveness ping.
//! One task runs per active transfer and is cancelled through a token so it
//! can never race the transfer it protects.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::CameraAdapter;

/// Handle to a running keep-alive task. Cancelling the token stops the loop;
/// `stop().await` additionally waits for the task to finish.
pub struct KeepAliveHandle {
    token: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

impl KeepAliveHandle {
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.join.await;
    }
}

/// Spawn the per-transfer keep-alive task for one camera.
pub fn spawn(
    adapter: Arc<CameraAdapter>,
    peer: Ipv4Addr,
    interval: Duration,
    token: CancellationToken,
) -> KeepAliveHandle {
    let task_token = token.clone();
    let join = tokio::spawn(async move {
        debug!("keep-alive started for {peer}");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = task_token.cancelled() => break,
                _ = ticker.tick() => {
                    // Errors are ignored; a missed ping only matters if the
                    // transfer itself also stalls, which its own read
                    // timeout detects.
                    let _ = adapter.keep_alive(peer).await;
                }
            }
        }
        debug!("keep-alive stopped for {peer}");
    });
    KeepAliveHandle { token, join }
}
