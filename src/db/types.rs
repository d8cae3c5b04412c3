//! Row to JSON conversion for result cursors.
//!
//! Values are decoded with the first Rust type the driver accepts for the
//! column, in the order integer, float, text, boolean. Anything else (binary,
//! driver-specific types) becomes `null`.

use serde_json::Value as JsonValue;
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row};

/// One row of a result cursor, keyed by column name.
pub type JsonRow = serde_json::Map<String, JsonValue>;

pub trait RowToJson {
    fn to_json_map(&self) -> JsonRow;
}

macro_rules! impl_row_to_json {
    ($row:ty) => {
        impl RowToJson for $row {
            fn to_json_map(&self) -> JsonRow {
                self.columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, col)| (col.name().to_string(), decode_column!(self, idx)))
                    .collect()
            }
        }
    };
}

macro_rules! decode_column {
    ($row:expr, $idx:expr) => {
        if let Ok(v) = $row.try_get::<Option<i64>, _>($idx) {
            v.map(JsonValue::from).unwrap_or(JsonValue::Null)
        } else if let Ok(v) = $row.try_get::<Option<i32>, _>($idx) {
            v.map(JsonValue::from).unwrap_or(JsonValue::Null)
        } else if let Ok(v) = $row.try_get::<Option<f64>, _>($idx) {
            v.map(JsonValue::from).unwrap_or(JsonValue::Null)
        } else if let Ok(v) = $row.try_get::<Option<String>, _>($idx) {
            v.map(JsonValue::from).unwrap_or(JsonValue::Null)
        } else if let Ok(v) = $row.try_get::<Option<bool>, _>($idx) {
            v.map(JsonValue::from).unwrap_or(JsonValue::Null)
        } else {
            JsonValue::Null
        }
    };
}

impl_row_to_json!(MySqlRow);
impl_row_to_json!(PgRow);
impl_row_to_json!(SqliteRow);

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn fetch(sql: &str) -> Vec<JsonRow> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let rows = sqlx::query(sql).fetch_all(&pool).await.unwrap();
        rows.iter().map(|r| r.to_json_map()).collect()
    }

    #[tokio::test]
    async fn test_sqlite_scalar_types() {
        let rows = fetch("SELECT 42 AS n, 1.5 AS f, 'abc' AS s, NULL AS z").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["n"], 42);
        assert_eq!(rows[0]["f"], 1.5);
        assert_eq!(rows[0]["s"], "abc");
        assert_eq!(rows[0]["z"], JsonValue::Null);
    }
}
