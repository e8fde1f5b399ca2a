//! Spy handle used by the unit tests.

use crate::error::{Error, Result};
use crate::handle::{Handle, TxOptions};
use crate::value::Value;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub(crate) struct MockHandle {
    pub name: &'static str,
    healthy: AtomicBool,
    pings: AtomicUsize,
    closed: AtomicBool,
    pub max_open: Mutex<Option<usize>>,
    pub max_idle: Mutex<Option<usize>>,
    pub lifetime: Mutex<Option<Option<Duration>>>,
}

impl MockHandle {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            healthy: AtomicBool::new(true),
            pings: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            max_open: Mutex::new(None),
            max_idle: Mutex::new(None),
            lifetime: Mutex::new(None),
        }
    }

    pub fn down(name: &'static str) -> Self {
        let h = Self::new(name);
        h.set_healthy(false);
        h
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handle for MockHandle {
    type Rows = &'static str;
    type Row = &'static str;
    type ExecResult = &'static str;
    type Statement = &'static str;
    type Transaction = &'static str;

    async fn ping(&self) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Query(format!("{} is down", self.name)))
        }
    }

    async fn query(&self, _sql: &str, _params: &[Value]) -> Result<Self::Rows> {
        Ok(self.name)
    }

    async fn query_row(&self, _sql: &str, _params: &[Value]) -> Result<Self::Row> {
        Ok(self.name)
    }

    async fn exec(&self, sql: &str, _params: &[Value]) -> Result<Self::ExecResult> {
        if sql == "FAIL" {
            return Err(Error::Query("exec failed".to_string()));
        }
        Ok(self.name)
    }

    async fn prepare(&self, _sql: &str) -> Result<Self::Statement> {
        Ok(self.name)
    }

    async fn begin_tx(&self, _opts: TxOptions) -> Result<Self::Transaction> {
        Ok(self.name)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Query(format!("{} close failed", self.name)))
        }
    }

    fn set_max_open_conns(&self, n: usize) {
        *self.max_open.lock() = Some(n);
    }

    fn set_max_idle_conns(&self, n: usize) {
        *self.max_idle.lock() = Some(n);
    }

    fn set_conn_max_lifetime(&self, lifetime: Option<Duration>) {
        *self.lifetime.lock() = Some(lifetime);
    }
}
