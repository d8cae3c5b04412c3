//! sqlx-backed resource handles.
//!
//! Each handle is a cheap clone over shared state: the backend keeps one
//! clone to do its work and registers another with the execution context's
//! [`ResourceTracker`](crate::resource::ResourceTracker), so whichever side
//! closes first wins and the other side observes `is_closed()`.

use crate::db::pool::{DbConnection, DbPool};
use crate::db::types::{JsonRow, RowToJson};
use crate::error::{CloseError, ProxyError, ProxyResult};
use crate::resource::{ResourceHandle, ResourceKind};
use async_trait::async_trait;
use sqlx::{Column, Connection as _, Executor, Statement};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::sync::Mutex;
use tracing::{debug, warn};

struct ConnectionInner {
    data_source: String,
    connection: Mutex<Option<DbConnection>>,
    closed: AtomicBool,
    /// Set when the driver reported an I/O or protocol failure on this connection.
    broken: AtomicBool,
}

/// A pooled connection opened on behalf of one execution context.
///
/// Closing a healthy connection hands it back to its pool. A connection that
/// failed at the transport level is closed for real instead, so the pool can
/// open a replacement.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionInner>,
}

impl ConnectionHandle {
    /// Check a connection out of `pool`.
    pub async fn acquire(pool: &DbPool, data_source: impl Into<String>) -> ProxyResult<Self> {
        let connection = pool.acquire().await?;
        let data_source = data_source.into();
        debug!(data_source = %data_source, db_type = %pool.db_type(), "Connection acquired");
        Ok(Self {
            inner: Arc::new(ConnectionInner {
                data_source,
                connection: Mutex::new(Some(connection)),
                closed: AtomicBool::new(false),
                broken: AtomicBool::new(false),
            }),
        })
    }

    pub fn data_source(&self) -> &str {
        &self.inner.data_source
    }

    pub fn is_broken(&self) -> bool {
        self.inner.broken.load(Ordering::Acquire)
    }

    /// Prepare `sql` on this connection.
    pub async fn prepare(&self, sql: &str) -> ProxyResult<StatementHandle> {
        let mut guard = self.inner.connection.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| ProxyError::closed(ResourceKind::Connection))?;

        let result = db_dispatch!(DbConnection, conn, c => {
            (&mut **c).prepare(sql).await.map(|statement| {
                statement
                    .columns()
                    .iter()
                    .map(|col| col.name().to_string())
                    .collect::<Vec<_>>()
            })
        });
        let columns = self.check(result)?;

        Ok(StatementHandle::new(&self.inner.data_source, sql, columns))
    }

    /// Run a row-returning statement and buffer its rows into a cursor.
    pub async fn open_cursor(&self, statement: &StatementHandle) -> ProxyResult<CursorHandle> {
        if statement.is_closed() {
            return Err(ProxyError::closed(ResourceKind::Statement));
        }
        let mut guard = self.inner.connection.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| ProxyError::closed(ResourceKind::Connection))?;

        let sql = statement.sql();
        let result = db_dispatch!(DbConnection, conn, c => {
            sqlx::query(sql)
                .fetch_all(&mut **c)
                .await
                .map(|rows| rows.iter().map(|row| row.to_json_map()).collect::<Vec<_>>())
        });
        let rows = self.check(result)?;

        Ok(CursorHandle::new(
            &self.inner.data_source,
            statement.columns().to_vec(),
            rows,
        ))
    }

    /// Run a statement that returns no rows. Returns the affected row count.
    pub async fn execute(&self, statement: &StatementHandle) -> ProxyResult<u64> {
        if statement.is_closed() {
            return Err(ProxyError::closed(ResourceKind::Statement));
        }
        let mut guard = self.inner.connection.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| ProxyError::closed(ResourceKind::Connection))?;

        let sql = statement.sql();
        let result = db_dispatch!(DbConnection, conn, c => {
            sqlx::query(sql)
                .execute(&mut **c)
                .await
                .map(|done| done.rows_affected())
        });
        self.check(result)
    }

    fn check<T>(&self, result: Result<T, sqlx::Error>) -> ProxyResult<T> {
        result.map_err(|e| {
            let err = ProxyError::from(e);
            if err.breaks_connection() {
                warn!(
                    data_source = %self.inner.data_source,
                    error = %err,
                    "Connection marked broken"
                );
                self.inner.broken.store(true, Ordering::Release);
            }
            err
        })
    }
}

#[async_trait]
impl ResourceHandle for ConnectionHandle {
    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), CloseError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(connection) = self.inner.connection.lock().await.take() else {
            return Ok(());
        };

        if !self.is_broken() {
            drop(connection);
            debug!(data_source = %self.inner.data_source, "Connection returned to pool");
            return Ok(());
        }

        db_dispatch!(DbConnection, connection, c => c.detach().close().await).map_err(|e| {
            CloseError::with_source(
                ResourceKind::Connection,
                format!("data source '{}'", self.inner.data_source),
                e,
            )
        })
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("data_source", &self.inner.data_source)
            .field("closed", &self.is_closed())
            .field("broken", &self.is_broken())
            .finish()
    }
}

#[derive(Debug)]
struct StatementInner {
    data_source: String,
    sql: String,
    columns: Vec<String>,
    closed: AtomicBool,
}

/// A statement prepared on a [`ConnectionHandle`].
#[derive(Debug, Clone)]
pub struct StatementHandle {
    inner: Arc<StatementInner>,
}

impl StatementHandle {
    fn new(data_source: &str, sql: &str, columns: Vec<String>) -> Self {
        Self {
            inner: Arc::new(StatementInner {
                data_source: data_source.to_string(),
                sql: sql.to_string(),
                columns,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn data_source(&self) -> &str {
        &self.inner.data_source
    }

    pub fn sql(&self) -> &str {
        &self.inner.sql
    }

    /// Result column names; empty for statements that return no rows.
    pub fn columns(&self) -> &[String] {
        &self.inner.columns
    }

    pub fn returns_rows(&self) -> bool {
        !self.inner.columns.is_empty()
    }
}

#[async_trait]
impl ResourceHandle for StatementHandle {
    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), CloseError> {
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[derive(Debug)]
struct CursorInner {
    data_source: String,
    columns: Vec<String>,
    rows: std::sync::Mutex<Option<Vec<JsonRow>>>,
}

/// Rows produced by one statement execution.
#[derive(Debug, Clone)]
pub struct CursorHandle {
    inner: Arc<CursorInner>,
}

impl CursorHandle {
    fn new(data_source: &str, columns: Vec<String>, rows: Vec<JsonRow>) -> Self {
        Self {
            inner: Arc::new(CursorInner {
                data_source: data_source.to_string(),
                columns,
                rows: std::sync::Mutex::new(Some(rows)),
            }),
        }
    }

    pub fn data_source(&self) -> &str {
        &self.inner.data_source
    }

    pub fn columns(&self) -> &[String] {
        &self.inner.columns
    }

    /// Copy of the buffered rows.
    pub fn rows(&self) -> ProxyResult<Vec<JsonRow>> {
        self.inner
            .rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| ProxyError::closed(ResourceKind::ResultCursor))
    }

    pub fn len(&self) -> usize {
        self.inner
            .rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResourceHandle for CursorHandle {
    fn is_closed(&self) -> bool {
        self.inner
            .rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    async fn close(&self) -> Result<(), CloseError> {
        self.inner
            .rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}
