//! Data source pools.
//!
//! The proxy does not pool connections itself: each data source is backed by
//! a database-specific sqlx pool (MySqlPool, PgPool, SqlitePool) that creates
//! and recycles physical connections. [`DataSourceRegistry`] only creates
//! those pools from configuration and hands them out by data source ID.

use crate::config::DataSourceConfig;
use crate::error::{ProxyError, ProxyResult};
use sqlx::pool::PoolConnection;
use sqlx::{
    MySql, MySqlPool, PgPool, Postgres, Sqlite, SqlitePool, mysql::MySqlConnectOptions,
    mysql::MySqlPoolOptions, postgres::PgPoolOptions, sqlite::SqliteConnectOptions,
    sqlite::SqlitePoolOptions,
};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Database-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

/// A connection checked out of a [`DbPool`].
pub enum DbConnection {
    MySql(PoolConnection<MySql>),
    Postgres(PoolConnection<Postgres>),
    SQLite(PoolConnection<Sqlite>),
}

impl DbPool {
    /// Check a connection out of the pool.
    pub async fn acquire(&self) -> ProxyResult<DbConnection> {
        Ok(match self {
            DbPool::MySql(pool) => DbConnection::MySql(pool.acquire().await?),
            DbPool::Postgres(pool) => DbConnection::Postgres(pool.acquire().await?),
            DbPool::SQLite(pool) => DbConnection::SQLite(pool.acquire().await?),
        })
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        db_dispatch!(DbPool, self, pool => pool.close().await)
    }

    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbPool::MySql(_) => DatabaseType::MySQL,
            DbPool::Postgres(_) => DatabaseType::PostgreSQL,
            DbPool::SQLite(_) => DatabaseType::SQLite,
        }
    }
}

/// Data source pools keyed by data source ID.
#[derive(Debug, Clone, Default)]
pub struct DataSourceRegistry {
    pools: Arc<RwLock<HashMap<String, DbPool>>>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the pool for a data source and register it.
    pub async fn connect(&self, config: &DataSourceConfig) -> ProxyResult<()> {
        {
            let pools = self.pools.read().await;
            if pools.contains_key(&config.id) {
                return Err(duplicate(&config.id));
            }
        }

        info!(
            data_source = %config.id,
            db_type = %config.db_type,
            "Connecting to data source"
        );
        let pool = create_pool(config).await?;
        self.register(&config.id, pool).await
    }

    /// Register an already created pool under `id`.
    pub async fn register(&self, id: &str, pool: DbPool) -> ProxyResult<()> {
        // Re-check under the write lock; a concurrent connect may have won.
        let rejected = {
            let mut pools = self.pools.write().await;
            if pools.contains_key(id) {
                Some(pool)
            } else {
                pools.insert(id.to_string(), pool);
                None
            }
        };

        if let Some(pool) = rejected {
            pool.close().await;
            return Err(duplicate(id));
        }
        info!(data_source = %id, "Data source registered");
        Ok(())
    }

    pub async fn get_pool(&self, id: &str) -> ProxyResult<DbPool> {
        let pools = self.pools.read().await;
        pools
            .get(id)
            .cloned()
            .ok_or_else(|| ProxyError::data_source_not_found(id))
    }

    /// Registered data source IDs, sorted.
    pub async fn ids(&self) -> Vec<String> {
        let pools = self.pools.read().await;
        let mut ids: Vec<String> = pools.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close and forget every pool.
    pub async fn close_all(&self) {
        let drained: Vec<(String, DbPool)> = {
            let mut pools = self.pools.write().await;
            pools.drain().collect()
        };
        for (id, pool) in drained {
            pool.close().await;
            info!(data_source = %id, "Data source closed");
        }
    }
}

fn duplicate(id: &str) -> ProxyError {
    ProxyError::connection(
        format!("Data source '{}' already exists", id),
        "Use a different data source ID",
    )
}

async fn create_pool(config: &DataSourceConfig) -> ProxyResult<DbPool> {
    let opts = &config.pool_options;
    let is_sqlite = config.db_type == DatabaseType::SQLite;
    let connect_error = |e: sqlx::Error| {
        ProxyError::connection(
            format!("Failed to connect to '{}': {}", config.id, e),
            "Check the data source URL, credentials and server status",
        )
    };

    match config.db_type {
        DatabaseType::MySQL => {
            let options = MySqlConnectOptions::from_str(&config.connection_string)
                .map_err(connect_error)?
                .charset("utf8mb4");
            let pool = MySqlPoolOptions::new()
                .min_connections(opts.min_connections_or_default())
                .max_connections(opts.max_connections_or_default(is_sqlite))
                .acquire_timeout(opts.acquire_timeout_or_default())
                .idle_timeout(Some(opts.idle_timeout_or_default()))
                .test_before_acquire(opts.test_before_acquire_or_default())
                .connect_with(options)
                .await
                .map_err(connect_error)?;
            Ok(DbPool::MySql(pool))
        }
        DatabaseType::PostgreSQL => {
            let pool = PgPoolOptions::new()
                .min_connections(opts.min_connections_or_default())
                .max_connections(opts.max_connections_or_default(is_sqlite))
                .acquire_timeout(opts.acquire_timeout_or_default())
                .idle_timeout(Some(opts.idle_timeout_or_default()))
                .test_before_acquire(opts.test_before_acquire_or_default())
                .connect(&config.connection_string)
                .await
                .map_err(connect_error)?;
            Ok(DbPool::Postgres(pool))
        }
        DatabaseType::SQLite => {
            let options =
                SqliteConnectOptions::from_str(&config.connection_string).map_err(connect_error)?;
            let pool = SqlitePoolOptions::new()
                .min_connections(opts.min_connections_or_default())
                .max_connections(opts.max_connections_or_default(is_sqlite))
                .acquire_timeout(opts.acquire_timeout_or_default())
                .idle_timeout(Some(opts.idle_timeout_or_default()))
                .test_before_acquire(opts.test_before_acquire_or_default())
                .connect_with(options)
                .await
                .map_err(connect_error)?;
            Ok(DbPool::SQLite(pool))
        }
    }
}
