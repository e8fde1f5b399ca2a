//! Read/write splitting router over a master and its read replicas.

use crate::balancer::{
    BalanceAlgorithm, BalancerOptions, ReplicaBalancer, DEFAULT_HEALTH_CHECK_INTERVAL_MILLIS,
};
use crate::error::{Error, Result};
use crate::handle::{Handle, TxOptions};
use crate::master::MasterMonitor;
use crate::value::Value;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What a read does when no replica is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    /// Fail with [`Error::AllReplicasUnavailable`]
    None,
    /// Read from the master if it is healthy
    #[default]
    UseMaster,
}

/// Options for Router configuration.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    /// Period between two health checks, for master and replicas alike
    pub health_check_interval: Duration,
    /// Replica selection algorithm
    pub balance_algorithm: BalanceAlgorithm,
    /// Read behavior when every replica is down
    pub fallback: FallbackPolicy,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_millis(DEFAULT_HEALTH_CHECK_INTERVAL_MILLIS),
            balance_algorithm: BalanceAlgorithm::default(),
            fallback: FallbackPolicy::default(),
        }
    }
}

/// Routes writes to the master and reads to a healthy replica.
///
/// Liveness is tracked by two background loops, one probing the master and
/// one probing the replicas. Dispatch only consults their cached results and
/// never probes on its own. A read issued while no replica is alive goes to
/// the master under [`FallbackPolicy::UseMaster`]; writes never go to a
/// replica.
pub struct Router<H: Handle> {
    master: Option<MasterMonitor<H>>,
    balancer: ReplicaBalancer<H>,
    master_interval: Arc<RwLock<Duration>>,
    fallback: RwLock<FallbackPolicy>,
    cancel: CancellationToken,
    closed: Mutex<bool>,
}

impl<H: Handle> Router<H> {
    /// Create a router and start its health check loops.
    ///
    /// Without a master every write fails with [`Error::MasterUnavailable`].
    pub async fn new(
        master: Option<Arc<H>>,
        replicas: Vec<Arc<H>>,
        options: RouterOptions,
    ) -> Self {
        Self::with_parent(master, replicas, options, &CancellationToken::new()).await
    }

    /// Like [`Router::new`], with loops that also stop when `parent` is cancelled.
    pub async fn with_parent(
        master: Option<Arc<H>>,
        replicas: Vec<Arc<H>>,
        options: RouterOptions,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let master_interval = Arc::new(RwLock::new(options.health_check_interval));

        let balancer = ReplicaBalancer::new(
            replicas,
            BalancerOptions {
                health_check_interval: options.health_check_interval,
                algorithm: options.balance_algorithm,
            },
            &cancel,
        )
        .await;

        let master = match master {
            Some(handle) => Some(
                MasterMonitor::start(handle, master_interval.clone(), cancel.child_token()).await,
            ),
            None => None,
        };

        info!(
            master = master.is_some(),
            replicas = balancer.replicas().len(),
            "router started"
        );

        Self {
            master,
            balancer,
            master_interval,
            fallback: RwLock::new(options.fallback),
            cancel,
            closed: Mutex::new(false),
        }
    }

    fn check_closed(&self) -> Result<()> {
        if *self.closed.lock() {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    /// The handle writes go to.
    fn resolve_writer(&self) -> Result<Arc<H>> {
        self.check_closed()?;
        self.master
            .as_ref()
            .and_then(|m| m.healthy_handle())
            .cloned()
            .ok_or(Error::MasterUnavailable)
    }

    /// The handle reads go to.
    fn resolve_reader(&self) -> Result<Arc<H>> {
        self.check_closed()?;
        if let Some(replica) = self.balancer.pick() {
            return Ok(replica);
        }

        match self.fallback() {
            FallbackPolicy::UseMaster => {
                debug!("no replica alive, reading from master");
                self.master
                    .as_ref()
                    .and_then(|m| m.healthy_handle())
                    .cloned()
                    .ok_or(Error::MasterUnavailable)
            }
            FallbackPolicy::None => Err(Error::AllReplicasUnavailable),
        }
    }

    /// Run a read query on a replica.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<H::Rows> {
        self.resolve_reader()?.query(sql, params).await
    }

    pub async fn query_with_cancel(
        &self,
        cancel: &CancellationToken,
        sql: &str,
        params: &[Value],
    ) -> Result<H::Rows> {
        self.resolve_reader()?
            .query_with_cancel(cancel, sql, params)
            .await
    }

    /// Run a single-row read query on a replica.
    pub async fn query_row(&self, sql: &str, params: &[Value]) -> Result<H::Row> {
        self.resolve_reader()?.query_row(sql, params).await
    }

    pub async fn query_row_with_cancel(
        &self,
        cancel: &CancellationToken,
        sql: &str,
        params: &[Value],
    ) -> Result<H::Row> {
        self.resolve_reader()?
            .query_row_with_cancel(cancel, sql, params)
            .await
    }

    /// Run a write statement on the master.
    pub async fn exec(&self, sql: &str, params: &[Value]) -> Result<H::ExecResult> {
        self.resolve_writer()?.exec(sql, params).await
    }

    pub async fn exec_with_cancel(
        &self,
        cancel: &CancellationToken,
        sql: &str,
        params: &[Value],
    ) -> Result<H::ExecResult> {
        self.resolve_writer()?
            .exec_with_cancel(cancel, sql, params)
            .await
    }

    /// Prepare a statement on the master.
    pub async fn prepare(&self, sql: &str) -> Result<H::Statement> {
        self.resolve_writer()?.prepare(sql).await
    }

    pub async fn prepare_with_cancel(
        &self,
        cancel: &CancellationToken,
        sql: &str,
    ) -> Result<H::Statement> {
        self.resolve_writer()?.prepare_with_cancel(cancel, sql).await
    }

    /// Begin a transaction on the master.
    pub async fn begin(&self) -> Result<H::Transaction> {
        self.resolve_writer()?.begin().await
    }

    pub async fn begin_tx(&self, opts: TxOptions) -> Result<H::Transaction> {
        self.resolve_writer()?.begin_tx(opts).await
    }

    pub async fn begin_tx_with_cancel(
        &self,
        cancel: &CancellationToken,
        opts: TxOptions,
    ) -> Result<H::Transaction> {
        self.resolve_writer()?
            .begin_tx_with_cancel(cancel, opts)
            .await
    }

    /// Ping every handle concurrently.
    ///
    /// Cached liveness is left untouched. If several handles fail, the error
    /// of whichever failure completes first is returned.
    pub async fn ping(&self) -> Result<()> {
        self.check_closed()?;
        first_error(self.handles().map(|h| h.ping())).await
    }

    pub async fn ping_with_cancel(&self, cancel: &CancellationToken) -> Result<()> {
        self.check_closed()?;
        first_error(self.handles().map(|h| h.ping_with_cancel(cancel))).await
    }

    /// Stop both health check loops, then close every handle.
    ///
    /// All handles are closed even when some fail; the first failure is
    /// returned. Closing an already closed router does nothing.
    pub async fn close(&self) -> Result<()> {
        {
            let mut closed = self.closed.lock();
            if *closed {
                return Ok(());
            }
            *closed = true;
        }

        self.cancel.cancel();
        if let Some(master) = &self.master {
            master.shutdown().await;
        }
        self.balancer.shutdown().await;

        let res = first_error(self.handles().map(|h| h.close())).await;
        info!("router closed");
        res
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    pub fn set_max_open_conns(&self, n: usize) {
        self.handles().for_each(|h| h.set_max_open_conns(n));
    }

    pub fn set_max_idle_conns(&self, n: usize) {
        self.handles().for_each(|h| h.set_max_idle_conns(n));
    }

    pub fn set_conn_max_lifetime(&self, lifetime: Option<Duration>) {
        self.handles().for_each(|h| h.set_conn_max_lifetime(lifetime));
    }

    /// Replicas first, then the master.
    fn handles(&self) -> impl Iterator<Item = &Arc<H>> {
        self.balancer
            .replicas()
            .iter()
            .chain(self.master.as_ref().map(|m| m.handle()))
    }

    pub fn master(&self) -> Option<&Arc<H>> {
        self.master.as_ref().map(|m| m.handle())
    }

    pub fn replicas(&self) -> &[Arc<H>] {
        self.balancer.replicas()
    }

    pub fn balancer(&self) -> &ReplicaBalancer<H> {
        &self.balancer
    }

    /// Result of the last master probe.
    pub fn is_master_healthy(&self) -> bool {
        self.master.as_ref().is_some_and(|m| m.is_healthy())
    }

    /// True when at least one replica passed its last probe.
    pub fn is_replica_alive(&self) -> bool {
        self.balancer.is_alive()
    }

    pub fn fallback(&self) -> FallbackPolicy {
        *self.fallback.read()
    }

    pub fn set_fallback(&self, fallback: FallbackPolicy) {
        *self.fallback.write() = fallback;
    }

    pub fn balance_algorithm(&self) -> BalanceAlgorithm {
        self.balancer.algorithm()
    }

    pub fn set_balance_algorithm(&self, algorithm: BalanceAlgorithm) {
        self.balancer.set_algorithm(algorithm);
    }

    pub fn health_check_interval(&self) -> Duration {
        self.balancer.health_check_interval()
    }

    /// Applies to both the master and the replica loops from their next cycle.
    pub fn set_health_check_interval(&self, interval: Duration) {
        *self.master_interval.write() = interval;
        self.balancer.set_health_check_interval(interval);
    }

    pub fn health_check_interval_millis(&self) -> u64 {
        self.health_check_interval().as_millis() as u64
    }

    pub fn set_health_check_interval_millis(&self, millis: u64) {
        self.set_health_check_interval(Duration::from_millis(millis));
    }

    /// Probe master and replicas now and refresh the cached results.
    pub async fn check_health(&self) {
        if let Some(master) = &self.master {
            master.check_health().await;
        }
        self.balancer.check_health().await;
    }
}

impl<H: Handle> Drop for Router<H> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Drive all futures to completion and keep the first error, in completion order.
async fn first_error<I, F>(futures: I) -> Result<()>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<()>>,
{
    let mut pending: FuturesUnordered<F> = futures.into_iter().collect();
    let mut first = None;
    while let Some(res) = pending.next().await {
        if let Err(e) = res {
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}
