//! Error types for the router and its handles.

use thiserror::Error;

/// Result type for router operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for router operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The last master probe failed, or no master was configured
    #[error("master database is unavailable")]
    MasterUnavailable,

    /// No replica is alive and the fallback policy forbids using the master
    #[error("all read replicas are unavailable")]
    AllReplicasUnavailable,

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Error reported by a foreign handle implementation
    #[error("driver error: {0}")]
    Driver(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Query error
    #[error("Query error: {0}")]
    Query(String),

    /// Connection closed
    #[error("Connection is closed")]
    ConnectionClosed,

    /// Operation cancelled through its cancellation token
    #[error("Operation was cancelled")]
    Cancelled,

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Type conversion error
    #[error("Type conversion error: {0}")]
    TypeConversion(String),
}

impl Error {
    /// Wrap an arbitrary driver error.
    pub fn driver<E>(e: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Driver(Box::new(e))
    }

    /// Returns true for the errors produced by routing rather than by a handle.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::MasterUnavailable | Error::AllReplicasUnavailable)
    }
}
