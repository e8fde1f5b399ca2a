//! [`Handle`] implementation backed by a local SQLite database file.
//!
//! Each handle owns a single connection, opened lazily and reopened when it
//! outlives the configured lifetime. Replicas are normally opened with
//! [`SqliteOptions::read_only`] so that a routing mistake cannot write to them.

use crate::error::{Error, Result};
use crate::handle::{Handle, IsolationLevel, TxOptions};
use crate::value::Value;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection, OpenFlags};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Options for SqliteHandle configuration.
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    /// Database file
    pub path: PathBuf,
    /// Open without write access
    pub read_only: bool,
    /// How long to wait on a locked database
    pub busy_timeout: Duration,
}

impl SqliteOptions {
    pub fn read_write(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn read_only(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            read_only: true,
            ..Default::default()
        }
    }
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            read_only: false,
            busy_timeout: Duration::from_millis(5000),
        }
    }
}

/// Pool tuning received through the [`Handle`] setters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSettings {
    /// Recorded only; a handle never holds more than one connection
    pub max_open_conns: Option<usize>,
    /// `Some(0)` closes the connection after every call
    pub max_idle_conns: Option<usize>,
    /// Reopen the connection once it is older than this
    pub conn_max_lifetime: Option<Duration>,
}

/// Rows returned by a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    /// Column names
    pub columns: Vec<String>,
    /// Row data
    pub rows: Vec<Vec<Value>>,
    /// Number of rows affected (for INSERT/UPDATE/DELETE)
    pub rows_affected: i64,
}

impl RowSet {
    /// Create an empty result.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Get the number of rows.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Get the number of columns.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

/// Outcome of a write statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecSummary {
    pub rows_affected: usize,
    pub last_insert_id: i64,
}

struct OpenConnection {
    conn: Connection,
    opened_at: Instant,
}

impl OpenConnection {
    /// Past its lifetime and not inside a transaction.
    fn expired(&self, lifetime: Option<Duration>) -> bool {
        lifetime.is_some_and(|l| self.opened_at.elapsed() >= l) && self.conn.is_autocommit()
    }
}

struct Inner {
    options: SqliteOptions,
    conn: Mutex<Option<OpenConnection>>,
    settings: Mutex<PoolSettings>,
    closed: Mutex<bool>,
}

impl Inner {
    fn open(&self) -> Result<OpenConnection> {
        let flags = if self.options.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
        };

        let conn = Connection::open_with_flags(&self.options.path, flags)?;
        conn.busy_timeout(self.options.busy_timeout)?;
        if !self.options.read_only {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA temp_store = MEMORY;",
            )?;
        }

        debug!(
            path = ?self.options.path,
            read_only = self.options.read_only,
            "opened sqlite connection"
        );
        Ok(OpenConnection {
            conn,
            opened_at: Instant::now(),
        })
    }

    /// Run `f` on the connection, opening or recycling it as the pool settings require.
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if *self.closed.lock() {
            return Err(Error::ConnectionClosed);
        }

        let settings = *self.settings.lock();
        let mut slot = self.conn.lock();

        let open = match slot.take() {
            Some(open) if !open.expired(settings.conn_max_lifetime) => open,
            _ => self.open()?,
        };
        let result = f(&open.conn);

        if settings.max_idle_conns != Some(0) || !open.conn.is_autocommit() {
            *slot = Some(open);
        }
        result
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<RowSet> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            check_param_count(&stmt, params)?;
            let column_count = stmt.column_count();
            let columns: Vec<String> = stmt
                .column_names()
                .into_iter()
                .map(str::to_string)
                .collect();

            let mapped = stmt.query_map(params_from_iter(params.iter()), |row| {
                (0..column_count)
                    .map(|i| row.get::<_, rusqlite::types::Value>(i).map(Value::from))
                    .collect::<rusqlite::Result<Vec<_>>>()
            })?;

            let rows = mapped.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(RowSet {
                columns,
                rows,
                rows_affected: 0,
            })
        })
    }

    fn exec(&self, sql: &str, params: &[Value]) -> Result<ExecSummary> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            check_param_count(&stmt, params)?;
            let rows_affected = stmt.execute(params_from_iter(params.iter()))?;
            Ok(ExecSummary {
                rows_affected,
                last_insert_id: conn.last_insert_rowid(),
            })
        })
    }

    fn batch(&self, sql: &str) -> Result<()> {
        self.with_conn(|conn| Ok(conn.execute_batch(sql)?))
    }
}

fn check_param_count(stmt: &rusqlite::Statement<'_>, params: &[Value]) -> Result<()> {
    let expected = stmt.parameter_count();
    if expected != params.len() {
        return Err(Error::InvalidParameter(format!(
            "statement expects {} parameters, got {}",
            expected,
            params.len()
        )));
    }
    Ok(())
}

/// A SQLite database file seen as one router endpoint.
pub struct SqliteHandle {
    inner: Arc<Inner>,
}

impl SqliteHandle {
    /// Create a handle. The file is opened on first use.
    pub fn new(options: SqliteOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                conn: Mutex::new(None),
                settings: Mutex::new(PoolSettings::default()),
                closed: Mutex::new(false),
            }),
        }
    }

    /// Create a handle and open its connection right away.
    pub fn open(options: SqliteOptions) -> Result<Self> {
        let handle = Self::new(options);
        handle.inner.with_conn(|_| Ok(()))?;
        Ok(handle)
    }

    pub fn options(&self) -> &SqliteOptions {
        &self.inner.options
    }

    pub fn pool_settings(&self) -> PoolSettings {
        *self.inner.settings.lock()
    }

    /// Run several statements separated by semicolons.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.inner.batch(sql)
    }

    /// Check if the handle is closed.
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.lock()
    }
}

#[async_trait]
impl Handle for SqliteHandle {
    type Rows = RowSet;
    type Row = Option<Vec<Value>>;
    type ExecResult = ExecSummary;
    type Statement = SqliteStatement;
    type Transaction = SqliteTransaction;

    async fn ping(&self) -> Result<()> {
        self.inner
            .with_conn(|conn| Ok(conn.query_row("SELECT 1", [], |_| Ok(()))?))
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<RowSet> {
        self.inner.query(sql, params)
    }

    async fn query_row(&self, sql: &str, params: &[Value]) -> Result<Option<Vec<Value>>> {
        Ok(self.inner.query(sql, params)?.rows.into_iter().next())
    }

    async fn exec(&self, sql: &str, params: &[Value]) -> Result<ExecSummary> {
        self.inner.exec(sql, params)
    }

    async fn prepare(&self, sql: &str) -> Result<SqliteStatement> {
        self.inner.with_conn(|conn| {
            conn.prepare_cached(sql)?;
            Ok(())
        })?;
        Ok(SqliteStatement {
            inner: self.inner.clone(),
            sql: sql.to_string(),
        })
    }

    async fn begin_tx(&self, opts: TxOptions) -> Result<SqliteTransaction> {
        let begin = match opts.isolation {
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => "BEGIN IMMEDIATE",
            _ => "BEGIN DEFERRED",
        };

        // The pragma and BEGIN must land on the same connection.
        let read_only = opts.read_only;
        self.inner.with_conn(|conn| {
            if read_only {
                conn.execute_batch("PRAGMA query_only = 1")?;
            }
            if let Err(e) = conn.execute_batch(begin) {
                if read_only {
                    let _ = conn.execute_batch("PRAGMA query_only = 0");
                }
                return Err(e.into());
            }
            Ok(())
        })?;

        Ok(SqliteTransaction {
            inner: self.inner.clone(),
            read_only: opts.read_only,
            finished: false,
        })
    }

    async fn close(&self) -> Result<()> {
        *self.inner.closed.lock() = true;
        *self.inner.conn.lock() = None;
        Ok(())
    }

    fn set_max_open_conns(&self, n: usize) {
        self.inner.settings.lock().max_open_conns = Some(n);
    }

    fn set_max_idle_conns(&self, n: usize) {
        self.inner.settings.lock().max_idle_conns = Some(n);
        if n == 0 {
            let mut slot = self.inner.conn.lock();
            if slot.as_ref().is_some_and(|open| open.conn.is_autocommit()) {
                *slot = None;
            }
        }
    }

    fn set_conn_max_lifetime(&self, lifetime: Option<Duration>) {
        self.inner.settings.lock().conn_max_lifetime = lifetime;
    }
}

/// A statement validated against the handle it was prepared on.
pub struct SqliteStatement {
    inner: Arc<Inner>,
    sql: String,
}

impl SqliteStatement {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub async fn query(&self, params: &[Value]) -> Result<RowSet> {
        self.inner.query(&self.sql, params)
    }

    pub async fn exec(&self, params: &[Value]) -> Result<ExecSummary> {
        self.inner.exec(&self.sql, params)
    }
}

/// An open transaction. Rolled back on drop unless committed.
///
/// The transaction occupies the handle's connection: statements issued
/// through the handle before it ends run inside it.
pub struct SqliteTransaction {
    inner: Arc<Inner>,
    read_only: bool,
    finished: bool,
}

impl SqliteTransaction {
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<RowSet> {
        self.inner.query(sql, params)
    }

    pub async fn exec(&self, sql: &str, params: &[Value]) -> Result<ExecSummary> {
        self.inner.exec(sql, params)
    }

    /// Commit the transaction.
    pub async fn commit(mut self) -> Result<()> {
        self.finish("COMMIT")
    }

    /// Rollback the transaction.
    pub async fn rollback(mut self) -> Result<()> {
        self.finish("ROLLBACK")
    }

    fn finish(&mut self, sql: &str) -> Result<()> {
        self.finished = true;
        let read_only = self.read_only;
        self.inner.with_conn(|conn| {
            let result = conn.execute_batch(sql);
            if read_only {
                conn.execute_batch("PRAGMA query_only = 0")?;
            }
            Ok(result?)
        })
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.finish("ROLLBACK") {
                debug!("rollback on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn master(dir: &TempDir) -> SqliteHandle {
        let handle =
            SqliteHandle::open(SqliteOptions::read_write(dir.path().join("main.db"))).unwrap();
        handle
            .execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
            .unwrap();
        handle
    }

    #[tokio::test]
    async fn query_and_exec() {
        let dir = TempDir::new().unwrap();
        let db = master(&dir);

        let summary = db
            .exec("INSERT INTO users (name) VALUES (?)", &["alice".into()])
            .await
            .unwrap();
        assert_eq!(summary.rows_affected, 1);
        assert_eq!(summary.last_insert_id, 1);

        let rows = db.query("SELECT id, name FROM users", &[]).await.unwrap();
        assert_eq!(rows.columns, vec!["id", "name"]);
        assert_eq!(rows.row_count(), 1);
        assert_eq!(rows.rows[0], vec![Value::Int64(1), Value::String("alice".into())]);

        let row = db
            .query_row("SELECT name FROM users WHERE id = ?", &[2i64.into()])
            .await
            .unwrap();
        assert!(row.is_none());
    }

    #[tokio::test]
    async fn read_only_handle_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let _db = master(&dir);
        let replica = SqliteHandle::new(SqliteOptions::read_only(dir.path().join("main.db")));

        replica.ping().await.unwrap();
        let err = replica
            .exec("INSERT INTO users (name) VALUES ('x')", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Sqlite(_)));
    }

    #[tokio::test]
    async fn missing_replica_fails_ping() {
        let dir = TempDir::new().unwrap();
        let replica = SqliteHandle::new(SqliteOptions::read_only(dir.path().join("absent.db")));
        assert!(replica.ping().await.is_err());
    }

    #[tokio::test]
    async fn closed_handle_rejects_everything() {
        let dir = TempDir::new().unwrap();
        let db = master(&dir);
        db.close().await.unwrap();

        assert!(db.is_closed());
        assert!(matches!(db.ping().await, Err(Error::ConnectionClosed)));
        assert!(matches!(db.query("SELECT 1", &[]).await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn transaction_commit_and_rollback() {
        let dir = TempDir::new().unwrap();
        let db = master(&dir);

        let tx = db.begin().await.unwrap();
        tx.exec("INSERT INTO users (name) VALUES ('a')", &[]).await.unwrap();
        tx.rollback().await.unwrap();

        let tx = db
            .begin_tx(TxOptions {
                isolation: IsolationLevel::Serializable,
                read_only: false,
            })
            .await
            .unwrap();
        tx.exec("INSERT INTO users (name) VALUES ('b')", &[]).await.unwrap();
        tx.commit().await.unwrap();

        {
            let tx = db.begin().await.unwrap();
            tx.exec("INSERT INTO users (name) VALUES ('c')", &[]).await.unwrap();
        }

        let rows = db.query("SELECT name FROM users", &[]).await.unwrap();
        assert_eq!(rows.rows, vec![vec![Value::String("b".into())]]);
    }

    #[tokio::test]
    async fn read_only_transaction_blocks_writes() {
        let dir = TempDir::new().unwrap();
        let db = master(&dir);

        let tx = db
            .begin_tx(TxOptions {
                read_only: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(tx.exec("INSERT INTO users (name) VALUES ('a')", &[]).await.is_err());
        tx.commit().await.unwrap();

        db.exec("INSERT INTO users (name) VALUES ('a')", &[]).await.unwrap();
    }

    #[tokio::test]
    async fn prepared_statement_runs_on_its_handle() {
        let dir = TempDir::new().unwrap();
        let db = master(&dir);

        assert!(db.prepare("SELEC nonsense").await.is_err());

        let stmt = db.prepare("INSERT INTO users (name) VALUES (?)").await.unwrap();
        assert_eq!(stmt.sql(), "INSERT INTO users (name) VALUES (?)");
        stmt.exec(&["x".into()]).await.unwrap();
        stmt.exec(&["y".into()]).await.unwrap();

        let count = db.prepare("SELECT COUNT(*) FROM users").await.unwrap();
        let rows = count.query(&[]).await.unwrap();
        assert_eq!(rows.rows[0][0], Value::Int64(2));
    }

    #[tokio::test]
    async fn pool_settings_are_applied() {
        let dir = TempDir::new().unwrap();
        let db = master(&dir);

        db.set_max_open_conns(4);
        db.set_max_idle_conns(0);
        db.set_conn_max_lifetime(Some(Duration::from_millis(1)));
        assert_eq!(
            db.pool_settings(),
            PoolSettings {
                max_open_conns: Some(4),
                max_idle_conns: Some(0),
                conn_max_lifetime: Some(Duration::from_millis(1)),
            }
        );
        assert!(db.inner.conn.lock().is_none());

        // reopened on demand; data lives in the file
        db.exec("INSERT INTO users (name) VALUES ('a')", &[]).await.unwrap();
        assert!(db.inner.conn.lock().is_none());
        let rows = db.query("SELECT COUNT(*) FROM users", &[]).await.unwrap();
        assert_eq!(rows.rows[0][0], Value::Int64(1));
    }

    #[tokio::test]
    async fn idle_setting_keeps_open_transaction() {
        let dir = TempDir::new().unwrap();
        let db = master(&dir);
        db.set_max_idle_conns(0);

        let tx = db.begin().await.unwrap();
        tx.exec("INSERT INTO users (name) VALUES ('a')", &[]).await.unwrap();
        assert!(db.inner.conn.lock().is_some());
        tx.commit().await.unwrap();
        assert!(db.inner.conn.lock().is_none());

        let rows = db.query("SELECT COUNT(*) FROM users", &[]).await.unwrap();
        assert_eq!(rows.rows[0][0], Value::Int64(1));
    }

    #[tokio::test]
    async fn read_only_transaction_survives_connection_recycling() {
        let dir = TempDir::new().unwrap();
        let db = master(&dir);
        db.set_max_idle_conns(0);

        let tx = db
            .begin_tx(TxOptions {
                read_only: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(tx.exec("INSERT INTO users (name) VALUES ('a')", &[]).await.is_err());
        tx.commit().await.unwrap();

        let rows = db.query("SELECT COUNT(*) FROM users", &[]).await.unwrap();
        assert_eq!(rows.rows[0][0], Value::Int64(0));
    }

    #[tokio::test]
    async fn read_only_transaction_survives_expired_lifetime() {
        let dir = TempDir::new().unwrap();
        let db = master(&dir);
        db.set_conn_max_lifetime(Some(Duration::ZERO));

        let tx = db
            .begin_tx(TxOptions {
                read_only: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(tx.exec("INSERT INTO users (name) VALUES ('a')", &[]).await.is_err());
        tx.rollback().await.unwrap();

        // query_only is cleared once the transaction ends
        db.exec("INSERT INTO users (name) VALUES ('b')", &[]).await.unwrap();
        let rows = db.query("SELECT COUNT(*) FROM users", &[]).await.unwrap();
        assert_eq!(rows.rows[0][0], Value::Int64(1));
    }

    #[tokio::test]
    async fn parameter_count_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let db = master(&dir);

        let err = db
            .exec("INSERT INTO users (name) VALUES (?)", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));

        let err = db
            .query("SELECT name FROM users WHERE id = ?", &[1i64.into(), 2i64.into()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }
}
