//! Liveness tracking for the master handle.

use crate::handle::Handle;
use crate::health::{spawn_probe_loop, stop_probe_loop};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct MasterState<H> {
    handle: Arc<H>,
    healthy: RwLock<bool>,
}

impl<H: Handle> MasterState<H> {
    async fn check_health(&self) {
        let healthy = match self.handle.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!("master health check failed: {}", e);
                false
            }
        };

        let previous = std::mem::replace(&mut *self.healthy.write(), healthy);
        if previous != healthy {
            info!(healthy, "master health changed");
        }
    }
}

/// Caches the result of the last master probe and refreshes it periodically.
pub(crate) struct MasterMonitor<H> {
    state: Arc<MasterState<H>>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<H: Handle> MasterMonitor<H> {
    /// Probe once, then keep probing every `interval` until `cancel` fires.
    pub(crate) async fn start(
        handle: Arc<H>,
        interval: Arc<RwLock<Duration>>,
        cancel: CancellationToken,
    ) -> Self {
        let state = Arc::new(MasterState {
            handle,
            healthy: RwLock::new(false),
        });
        state.check_health().await;

        let worker = {
            let state = state.clone();
            spawn_probe_loop("master", interval, cancel.clone(), move || {
                let state = state.clone();
                async move { state.check_health().await }
            })
        };

        Self {
            state,
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub(crate) fn handle(&self) -> &Arc<H> {
        &self.state.handle
    }

    /// The master, if its last probe succeeded.
    pub(crate) fn healthy_handle(&self) -> Option<&Arc<H>> {
        self.is_healthy().then_some(&self.state.handle)
    }

    pub(crate) fn is_healthy(&self) -> bool {
        *self.state.healthy.read()
    }

    pub(crate) async fn check_health(&self) {
        self.state.check_health().await;
    }

    pub(crate) async fn shutdown(&self) {
        let worker = self.worker.lock().take();
        stop_probe_loop("master", &self.cancel, worker).await;
    }
}

impl<H> Drop for MasterMonitor<H> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
