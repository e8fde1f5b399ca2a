//! HA Router - read/write splitting over a master and its read replicas
//!
//! This crate routes writes to a master [`Handle`] and spreads reads over the
//! replicas that passed their last health check, falling back to the master
//! when every replica is down. Health checks run in background tasks; the
//! dispatch path only reads their cached results.
//!
//! # Example
//!
//! ```no_run
//! use ha_router::{Router, RouterOptions, SqliteHandle, SqliteOptions};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let master = Arc::new(SqliteHandle::new(SqliteOptions::read_write("app.db")));
//!     let replica = Arc::new(SqliteHandle::new(SqliteOptions::read_only("app.db")));
//!
//!     let db = Router::new(Some(master), vec![replica], RouterOptions::default()).await;
//!
//!     db.exec("INSERT INTO users (name) VALUES (?)", &["alice".into()]).await?;
//!     let result = db.query("SELECT * FROM users", &[]).await?;
//!
//!     for row in result.rows {
//!         println!("{:?}", row);
//!     }
//!
//!     db.close().await?;
//!     Ok(())
//! }
//! ```

pub mod balancer;
pub mod error;
pub mod handle;
mod health;
pub mod live_set;
mod master;
pub mod router;
pub mod sqlite;
pub mod value;

#[cfg(test)]
mod mock;

pub use balancer::{
    BalanceAlgorithm, BalancerOptions, ReplicaBalancer, DEFAULT_HEALTH_CHECK_INTERVAL_MILLIS,
};
pub use error::{Error, Result};
pub use handle::{Handle, IsolationLevel, TxOptions};
pub use live_set::LiveSet;
pub use router::{FallbackPolicy, Router, RouterOptions};
pub use sqlite::{
    ExecSummary, PoolSettings, RowSet, SqliteHandle, SqliteOptions, SqliteStatement,
    SqliteTransaction,
};
pub use tokio_util::sync::CancellationToken;
pub use value::Value;
