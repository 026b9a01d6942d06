//! Shared relational store.
//!
//! Every node in the cluster opens its own pool against the same SQLite
//! database. The store provides the cluster-wide mutual exclusion used for job
//! claims: [`Store::lock_table`] opens a `BEGIN IMMEDIATE` transaction, which
//! SQLite grants to at most one connection across all processes at a time.
//! Waiting for the lock is bounded by the configured lock timeout.

use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool};

use crate::error::{is_busy, NodeError, Result};

const SCHEMA: &str = include_str!("schema.sql");

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// SQLite URL, e.g. `sqlite:/var/lib/markhive/cluster.db`
    pub url: String,
    /// Upper bound on waiting for the cluster-wide lock.
    pub lock_timeout: Duration,
    pub max_connections: u32,
}

impl StoreOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            lock_timeout: Duration::from_secs(10),
            max_connections: 8,
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }
}

/// Connection pool to the shared store. Connected at most once.
#[derive(Debug)]
pub struct Store {
    options: StoreOptions,
    pool: OnceLock<SqlitePool>,
}

impl Store {
    pub fn new(options: StoreOptions) -> Self {
        Self {
            options,
            pool: OnceLock::new(),
        }
    }

    /// Convenience for `Store::new` followed by `connect`.
    pub async fn open(options: StoreOptions) -> Result<Self> {
        let store = Self::new(options);
        store.connect().await?;
        Ok(store)
    }

    /// Open the pool and make sure the coordination tables exist.
    ///
    /// # Errors
    ///
    /// `AlreadyConnected` on a second call, `ConnectionFailure` if the
    /// database cannot be opened.
    pub async fn connect(&self) -> Result<()> {
        if self.pool.get().is_some() {
            return Err(NodeError::AlreadyConnected);
        }

        let connect_options = SqliteConnectOptions::from_str(&self.options.url)
            .map_err(|e| NodeError::ConnectionFailure(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(self.options.lock_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(self.options.max_connections)
            .acquire_timeout(self.options.lock_timeout)
            .connect_with(connect_options)
            .await
            .map_err(|e| NodeError::ConnectionFailure(e.to_string()))?;

        self.pool
            .set(pool.clone())
            .map_err(|_| NodeError::AlreadyConnected)?;

        self.initialize_schema().await?;
        tracing::debug!(url = %self.options.url, "Store connected");
        Ok(())
    }

    async fn initialize_schema(&self) -> Result<()> {
        let mut lock = self.lock_table("schema").await?;
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if !statement.is_empty() {
                sqlx::query(statement).execute(lock.conn()?).await?;
            }
        }
        lock.release().await
    }

    pub fn pool(&self) -> Result<&SqlitePool> {
        self.pool
            .get()
            .ok_or_else(|| NodeError::ConnectionFailure("store is not connected".into()))
    }

    /// Acquire the cluster-wide lock guarding `table`.
    ///
    /// The returned guard holds an open write transaction; statements run
    /// through [`TableLock::conn`] are part of it. Hold it only for the
    /// transition being protected.
    pub async fn lock_table(&self, table: &'static str) -> Result<TableLock> {
        let pool = self.pool()?;
        let mut conn = tokio::time::timeout(self.options.lock_timeout, pool.acquire())
            .await
            .map_err(|_| NodeError::LockTimeout(table))??;

        match sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await {
            Ok(_) => Ok(TableLock {
                table,
                conn: Some(conn),
            }),
            Err(sqlx::Error::Database(db)) if is_busy(db.code().as_deref()) => {
                tracing::debug!(table, "Table lock busy");
                Err(NodeError::LockTimeout(table))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn close(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
    }
}

/// An open `BEGIN IMMEDIATE` transaction.
///
/// Dropping the guard without [`release`](TableLock::release) or
/// [`abort`](TableLock::abort) closes the connection, which rolls the
/// transaction back.
#[derive(Debug)]
pub struct TableLock {
    table: &'static str,
    conn: Option<PoolConnection<Sqlite>>,
}

impl TableLock {
    pub fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| NodeError::Internal(format!("{} lock already released", self.table)))
    }

    /// Commit the protected transition and release the lock.
    pub async fn release(mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = sqlx::query("COMMIT").execute(&mut *conn).await {
                // The connection may still hold the transaction; never pool it.
                drop(conn.detach());
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Roll back and release the lock.
    pub async fn abort(mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                drop(conn.detach());
                return Err(e.into());
            }
        }
        Ok(())
    }
}

impl Drop for TableLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::warn!(table = self.table, "Table lock dropped while held, discarding connection");
            drop(conn.detach());
        }
    }
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
