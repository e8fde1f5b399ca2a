//! Replica load balancer with periodic health checks.

use crate::handle::Handle;
use crate::health::{spawn_probe_loop, stop_probe_loop};
use crate::live_set::LiveSet;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default period between two health checks.
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MILLIS: u64 = 5000;

/// How [`ReplicaBalancer::pick`] chooses among live replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BalanceAlgorithm {
    /// Rotate through live replicas in construction order
    RoundRobin,
    /// Pick a live replica uniformly at random
    #[default]
    Random,
}

/// Options for ReplicaBalancer configuration.
#[derive(Debug, Clone)]
pub struct BalancerOptions {
    /// Period between two health checks
    pub health_check_interval: Duration,
    /// Selection algorithm
    pub algorithm: BalanceAlgorithm,
}

impl Default for BalancerOptions {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_millis(DEFAULT_HEALTH_CHECK_INTERVAL_MILLIS),
            algorithm: BalanceAlgorithm::default(),
        }
    }
}

/// State shared with the background health check task.
struct Replicas<H> {
    all: Vec<Arc<H>>,
    live: LiveSet<H>,
}

impl<H: Handle> Replicas<H> {
    /// Ping every replica concurrently and publish the ones that answered.
    async fn check_health(&self) {
        let results = join_all(self.all.iter().map(|replica| replica.ping())).await;

        let mut alive = Vec::with_capacity(self.all.len());
        for (idx, (replica, result)) in self.all.iter().zip(results).enumerate() {
            match result {
                Ok(()) => alive.push(replica.clone()),
                Err(e) => warn!(replica = idx, "replica health check failed: {}", e),
            }
        }

        let previous = self.live.len();
        let count = alive.len();
        if self.live.replace(alive) {
            debug!(previous, live = count, "live replica set changed");
            if count == 0 && !self.all.is_empty() {
                warn!("no read replica is alive");
            }
        }
    }
}

/// Spreads reads over the replicas that passed their last health check.
pub struct ReplicaBalancer<H: Handle> {
    replicas: Arc<Replicas<H>>,
    algorithm: RwLock<BalanceAlgorithm>,
    interval: Arc<RwLock<Duration>>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<H: Handle> ReplicaBalancer<H> {
    /// Create a balancer and start its health check loop.
    ///
    /// One health check runs before this returns, so the live set is
    /// populated for the first caller. The loop stops when `parent` is
    /// cancelled or the balancer is destroyed.
    pub async fn new(
        replicas: Vec<Arc<H>>,
        options: BalancerOptions,
        parent: &CancellationToken,
    ) -> Self {
        let replicas = Arc::new(Replicas {
            all: replicas,
            live: LiveSet::new(),
        });
        replicas.check_health().await;

        let interval = Arc::new(RwLock::new(options.health_check_interval));
        let cancel = parent.child_token();

        let worker = {
            let replicas = replicas.clone();
            spawn_probe_loop("replicas", interval.clone(), cancel.clone(), move || {
                let replicas = replicas.clone();
                async move { replicas.check_health().await }
            })
        };

        info!(
            replicas = replicas.all.len(),
            live = replicas.live.len(),
            "replica balancer started"
        );

        Self {
            replicas,
            algorithm: RwLock::new(options.algorithm),
            interval,
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// True when at least one replica passed its last health check.
    pub fn is_alive(&self) -> bool {
        !self.replicas.live.is_empty()
    }

    /// Choose a live replica, or `None` if none is alive.
    pub fn pick(&self) -> Option<Arc<H>> {
        match self.algorithm() {
            BalanceAlgorithm::RoundRobin => self.replicas.live.next(),
            BalanceAlgorithm::Random => self.replicas.live.random(),
        }
    }

    /// Probe every replica now and publish the result.
    pub async fn check_health(&self) {
        self.replicas.check_health().await;
    }

    /// Number of replicas that passed their last health check.
    pub fn live_count(&self) -> usize {
        self.replicas.live.len()
    }

    /// All replicas, alive or not, in construction order.
    pub fn replicas(&self) -> &[Arc<H>] {
        &self.replicas.all
    }

    pub fn algorithm(&self) -> BalanceAlgorithm {
        *self.algorithm.read()
    }

    pub fn set_algorithm(&self, algorithm: BalanceAlgorithm) {
        *self.algorithm.write() = algorithm;
    }

    pub fn health_check_interval(&self) -> Duration {
        *self.interval.read()
    }

    /// Takes effect after the sleep currently in progress.
    pub fn set_health_check_interval(&self, interval: Duration) {
        *self.interval.write() = interval;
    }

    pub fn health_check_interval_millis(&self) -> u64 {
        self.health_check_interval().as_millis() as u64
    }

    pub fn set_health_check_interval_millis(&self, millis: u64) {
        self.set_health_check_interval(Duration::from_millis(millis));
    }

    /// Signal the health check loop to stop. Does not close any handle.
    pub fn destroy(&self) {
        self.cancel.cancel();
    }

    /// Stop the health check loop and wait for it to exit.
    pub async fn shutdown(&self) {
        let worker = self.worker.lock().take();
        stop_probe_loop("replicas", &self.cancel, worker).await;
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

impl<H: Handle> Drop for ReplicaBalancer<H> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
