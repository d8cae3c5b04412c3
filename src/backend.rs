//! Backend handler: runs SQL on data sources on behalf of an execution context.
//!
//! The routing layer decides which data sources a statement goes to; this
//! handler runs it on each of them concurrently. Connections come from the
//! context, one per data source; every statement and cursor is registered
//! with the context's tracker the moment it is opened. Nothing here closes resources: teardown belongs to
//! [`ExecutionContext::finish`](crate::context::ExecutionContext::finish).

use crate::context::ExecutionContext;
use crate::db::types::JsonRow;
use crate::db::DataSourceRegistry;
use crate::error::{ProxyError, ProxyResult};
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

/// What one data source produced for a statement.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecuteOutcome {
    Rows {
        columns: Vec<String>,
        rows: Vec<JsonRow>,
    },
    Update {
        rows_affected: u64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct DataSourceResult {
    pub data_source: String,
    #[serde(flatten)]
    pub outcome: ExecuteOutcome,
    pub execution_time_ms: u64,
}

pub struct BackendHandler {
    data_sources: Arc<DataSourceRegistry>,
    query_timeout: Duration,
}

impl BackendHandler {
    pub fn new(data_sources: Arc<DataSourceRegistry>, query_timeout: Duration) -> Self {
        Self {
            data_sources,
            query_timeout,
        }
    }

    /// Execute `sql` on every data source in `targets`, or on all registered
    /// data sources when `targets` is empty.
    ///
    /// Targets run concurrently. When any of them fails, the first failure in
    /// target order is returned after all targets have finished; resources
    /// the failed targets opened stay registered for teardown.
    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        sql: &str,
        targets: &[String],
    ) -> ProxyResult<Vec<DataSourceResult>> {
        let targets = if targets.is_empty() {
            self.data_sources.ids().await
        } else {
            targets.to_vec()
        };
        if targets.is_empty() {
            return Err(ProxyError::config("No data sources configured"));
        }

        debug!(
            context_id = %ctx.id(),
            sql = %sql,
            targets = targets.len(),
            "Executing statement"
        );

        let results = join_all(
            targets
                .iter()
                .map(|target| self.execute_on(ctx, target, sql)),
        )
        .await;

        results.into_iter().collect()
    }

    async fn execute_on(
        &self,
        ctx: &ExecutionContext,
        data_source: &str,
        sql: &str,
    ) -> ProxyResult<DataSourceResult> {
        let start = Instant::now();
        let result = timeout(self.query_timeout, self.run(ctx, data_source, sql)).await;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) => Err(ProxyError::timeout(
                format!("statement on data source '{}'", data_source),
                self.query_timeout.as_secs(),
            )),
        };

        match outcome {
            Ok(outcome) => Ok(DataSourceResult {
                data_source: data_source.to_string(),
                outcome,
                execution_time_ms: start.elapsed().as_millis() as u64,
            }),
            Err(e) => {
                warn!(
                    context_id = %ctx.id(),
                    data_source = %data_source,
                    error = %e,
                    "Statement failed"
                );
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        ctx: &ExecutionContext,
        data_source: &str,
        sql: &str,
    ) -> ProxyResult<ExecuteOutcome> {
        let pool = self.data_sources.get_pool(data_source).await?;
        let resources = ctx.resources();

        let connection = ctx.connection(data_source, &pool).await?;

        let statement = connection.prepare(sql).await?;
        resources.add_statement(statement.clone());

        if statement.returns_rows() {
            let cursor = connection.open_cursor(&statement).await?;
            resources.add_result_cursor(cursor.clone());
            Ok(ExecuteOutcome::Rows {
                columns: cursor.columns().to_vec(),
                rows: cursor.rows()?,
            })
        } else {
            let rows_affected = connection.execute(&statement).await?;
            // Later reads of this context must see this write.
            ctx.routing_state().mark_master_visited();
            Ok(ExecuteOutcome::Update { rows_affected })
        }
    }
}
