//! The connection handle abstraction the router dispatches to.
//!
//! A [`Handle`] is one endpoint (master or replica) as seen by the router. The
//! router never opens connections or runs SQL itself: it probes handles with
//! [`Handle::ping`] and forwards reads and writes to whichever handle it
//! resolves. Handles are shared as `Arc<H>` and compared by pointer identity.

use crate::error::{Error, Result};
use crate::value::Value;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Transaction isolation level requested by [`TxOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Whatever the driver uses by default
    #[default]
    Default,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Options for beginning a transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxOptions {
    /// Requested isolation level
    pub isolation: IsolationLevel,
    /// Reject writes inside the transaction
    pub read_only: bool,
}

/// A database endpoint the router can probe and dispatch to.
#[async_trait]
pub trait Handle: Send + Sync + 'static {
    /// Result of a multi-row query.
    type Rows: Send;
    /// Result of a single-row query.
    type Row: Send;
    /// Result of a write statement.
    type ExecResult: Send;
    /// A prepared statement.
    type Statement: Send;
    /// An open transaction.
    type Transaction: Send;

    /// Liveness probe.
    async fn ping(&self) -> Result<()>;

    /// Run a read query.
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Self::Rows>;

    /// Run a read query returning at most one row.
    async fn query_row(&self, sql: &str, params: &[Value]) -> Result<Self::Row>;

    /// Run a write statement.
    async fn exec(&self, sql: &str, params: &[Value]) -> Result<Self::ExecResult>;

    /// Prepare a statement.
    async fn prepare(&self, sql: &str) -> Result<Self::Statement>;

    /// Begin a transaction with default options.
    async fn begin(&self) -> Result<Self::Transaction> {
        self.begin_tx(TxOptions::default()).await
    }

    /// Begin a transaction.
    async fn begin_tx(&self, opts: TxOptions) -> Result<Self::Transaction>;

    /// Release the handle's resources.
    async fn close(&self) -> Result<()>;

    fn set_max_open_conns(&self, n: usize);

    fn set_max_idle_conns(&self, n: usize);

    /// `None` means connections are reused forever.
    fn set_conn_max_lifetime(&self, lifetime: Option<Duration>);

    async fn ping_with_cancel(&self, cancel: &CancellationToken) -> Result<()> {
        with_cancel(cancel, self.ping()).await
    }

    async fn query_with_cancel(
        &self,
        cancel: &CancellationToken,
        sql: &str,
        params: &[Value],
    ) -> Result<Self::Rows> {
        with_cancel(cancel, self.query(sql, params)).await
    }

    async fn query_row_with_cancel(
        &self,
        cancel: &CancellationToken,
        sql: &str,
        params: &[Value],
    ) -> Result<Self::Row> {
        with_cancel(cancel, self.query_row(sql, params)).await
    }

    async fn exec_with_cancel(
        &self,
        cancel: &CancellationToken,
        sql: &str,
        params: &[Value],
    ) -> Result<Self::ExecResult> {
        with_cancel(cancel, self.exec(sql, params)).await
    }

    async fn prepare_with_cancel(
        &self,
        cancel: &CancellationToken,
        sql: &str,
    ) -> Result<Self::Statement> {
        with_cancel(cancel, self.prepare(sql)).await
    }

    async fn begin_tx_with_cancel(
        &self,
        cancel: &CancellationToken,
        opts: TxOptions,
    ) -> Result<Self::Transaction> {
        with_cancel(cancel, self.begin_tx(opts)).await
    }
}

/// Race `fut` against `cancel`, failing with [`Error::Cancelled`] if the token fires first.
pub async fn with_cancel<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send,
{
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}

/// Pointer identity of two handle lists, element by element.
pub(crate) fn same_handles<H>(a: &[Arc<H>], b: &[Arc<H>]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| Arc::ptr_eq(x, y))
}
