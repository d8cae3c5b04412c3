//! Database access layer.
//!
//! This module provides:
//! - Data source pools (external to the proxy, created from configuration)
//! - sqlx-backed connection, statement and cursor handles
//! - Row to JSON conversion
//! - Database dispatch macros for reducing code duplication

#[macro_use]
pub mod macros;
pub mod handles;
pub mod pool;
pub mod types;

pub use handles::{ConnectionHandle, CursorHandle, StatementHandle};
pub use pool::{DataSourceRegistry, DatabaseType, DbConnection, DbPool};
pub use types::{JsonRow, RowToJson};
