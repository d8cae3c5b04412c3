//! Database dispatch macros for reducing code duplication.
//!
//! The backend enums ([`DbPool`](super::DbPool), [`DbConnection`](super::DbConnection))
//! wrap one sqlx type per database. Most operations are textually identical
//! for every variant, so the match arms are generated here.

/// Run the same expression against whichever variant `$value` holds.
///
/// # Example
///
/// ```ignore
/// let rows_affected = db_dispatch!(DbConnection, conn, c => {
///     sqlx::query(sql).execute(&mut **c).await.map(|r| r.rows_affected())
/// });
/// ```
#[macro_export]
macro_rules! db_dispatch {
    ($enum:ident, $value:expr, $inner:ident => $body:expr) => {
        match $value {
            $crate::db::$enum::MySql($inner) => $body,
            $crate::db::$enum::Postgres($inner) => $body,
            $crate::db::$enum::SQLite($inner) => $body,
        }
    };
}

pub use db_dispatch;
