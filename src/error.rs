//! Error types for the proxy backend.
//!
//! This module defines all error types using `thiserror`. Teardown produces
//! [`CloseError`]s, aggregated into a [`ReleaseError`]; everything around it
//! (data sources, statement execution, configuration) reports [`ProxyError`].

use crate::resource::ResourceKind;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A close call on a tracked resource failed.
#[derive(Error, Debug)]
#[error("Failed to close {kind}: {message}")]
pub struct CloseError {
    kind: ResourceKind,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl CloseError {
    /// Create a close error without an underlying cause.
    pub fn new(kind: ResourceKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Create a close error wrapping the driver error that caused it.
    pub fn with_source(
        kind: ResourceKind,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Kind of resource whose close failed.
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Every close failure collected during one teardown, in encounter order.
///
/// Never empty: a teardown without failures returns `Ok(())` instead.
#[derive(Error, Debug)]
#[error("{first} (resource close failures: {count})", count = .rest.len() + 1)]
pub struct ReleaseError {
    #[source]
    first: CloseError,
    rest: Vec<CloseError>,
}

impl ReleaseError {
    /// Build the aggregate, or `None` when nothing failed.
    pub fn from_failures(failures: Vec<CloseError>) -> Option<Self> {
        let mut failures = failures.into_iter();
        let first = failures.next()?;
        Some(Self {
            first,
            rest: failures.collect(),
        })
    }

    /// The first close failure encountered.
    pub fn first(&self) -> &CloseError {
        &self.first
    }

    /// All close failures, first one first.
    pub fn failures(&self) -> impl Iterator<Item = &CloseError> {
        std::iter::once(&self.first).chain(&self.rest)
    }

    pub fn failure_count(&self) -> usize {
        self.rest.len() + 1
    }
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
    },

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("Data source not found: {data_source}")]
    DataSourceNotFound { data_source: String },

    #[error("{kind} is already closed")]
    Closed { kind: ResourceKind },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Resource release failed: {0}")]
    Release(#[from] ReleaseError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ProxyError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn data_source_not_found(data_source: impl Into<String>) -> Self {
        Self::DataSourceNotFound {
            data_source: data_source.into(),
        }
    }

    pub fn closed(kind: ResourceKind) -> Self {
        Self::Closed { kind }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Whether the connection that produced this error must not go back to its pool.
    pub fn breaks_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

/// Convert sqlx errors to ProxyError.
impl From<sqlx::Error> for ProxyError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => ProxyError::connection(
                msg.to_string(),
                "Check the data source URL format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                ProxyError::database(db_err.message(), code)
            }
            sqlx::Error::RowNotFound => ProxyError::database("No rows returned", None),
            // The configured acquire timeout is not carried by the driver error.
            sqlx::Error::PoolTimedOut => ProxyError::connection(
                "Timed out waiting for a pooled connection",
                "Raise max_connections or acquire_timeout for this data source",
            ),
            sqlx::Error::PoolClosed => {
                ProxyError::connection("Connection pool is closed", "Reconnect the data source")
            }
            sqlx::Error::Io(io_err) => ProxyError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => ProxyError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => ProxyError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnDecode { index, source } => {
                ProxyError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::WorkerCrashed => ProxyError::connection(
                "Database worker crashed",
                "Reconnect the data source",
            ),
            _ => ProxyError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for proxy backend operations.
pub type ProxyResult<T> = Result<T, ProxyError>;
