//! Background probe loop shared by the master monitor and the replica balancer.

use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Spawn a loop that sleeps for the current interval, then runs `probe`,
/// until `cancel` fires.
///
/// The interval is re-read before every sleep, so a change applies from the
/// next cycle onward.
pub(crate) fn spawn_probe_loop<F, Fut>(
    name: &'static str,
    interval: Arc<RwLock<Duration>>,
    cancel: CancellationToken,
    mut probe: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        info!(monitor = name, "health check loop started");

        loop {
            let period = *interval.read();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }

            if cancel.is_cancelled() {
                break;
            }

            debug!(monitor = name, "running health check");
            probe().await;
        }

        info!(monitor = name, "health check loop stopped");
    })
}

/// Cancel a loop and wait for its task to finish.
pub(crate) async fn stop_probe_loop(
    name: &'static str,
    cancel: &CancellationToken,
    worker: Option<JoinHandle<()>>,
) {
    cancel.cancel();
    if let Some(worker) = worker {
        if let Err(e) = worker.await {
            tracing::error!(monitor = name, "health check task failed: {}", e);
        }
    }
}
