//! End-to-end tests against SQLite files: statements run through the backend
//! handler and every resource is released when the context finishes.

use proxy_resource_tracker::backend::{BackendHandler, ExecuteOutcome};
use proxy_resource_tracker::config::DataSourceConfig;
use proxy_resource_tracker::context::ExecutionContext;
use proxy_resource_tracker::db::{ConnectionHandle, DataSourceRegistry};
use proxy_resource_tracker::{MasterVisitedState, ProxyError, ResourceHandle, ResourceTracker};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Register one SQLite file per id. With a small `max_connections`, a leaked
/// connection makes the next acquire time out.
async fn setup(dir: &Path, ids: &[&str], max_connections: u32) -> Arc<DataSourceRegistry> {
    let registry = Arc::new(DataSourceRegistry::new());
    for id in ids {
        let path = dir.join(format!("{id}.db"));
        let arg = format!(
            "{id}=sqlite:{}?mode=rwc&max_connections={max_connections}&acquire_timeout=2",
            path.display()
        );
        let config = DataSourceConfig::parse(&arg).expect("valid data source");
        registry.connect(&config).await.expect("connect");
    }
    registry
}

fn handler(registry: &Arc<DataSourceRegistry>) -> BackendHandler {
    BackendHandler::new(registry.clone(), Duration::from_secs(5))
}

#[tokio::test]
async fn test_statements_across_two_data_sources() {
    let dir = TempDir::new().unwrap();
    let registry = setup(dir.path(), &["ds_0", "ds_1"], 4).await;
    let handler = handler(&registry);

    let ctx = ExecutionContext::new();
    handler
        .execute(&ctx, "CREATE TABLE t_order (order_id INTEGER, user_id INTEGER)", &[])
        .await
        .unwrap();
    handler
        .execute(&ctx, "INSERT INTO t_order VALUES (1, 10)", &["ds_0".to_string()])
        .await
        .unwrap();
    handler
        .execute(&ctx, "INSERT INTO t_order VALUES (2, 11)", &["ds_1".to_string()])
        .await
        .unwrap();
    assert!(ctx.routing_state().is_master_visited());

    let results = handler
        .execute(&ctx, "SELECT order_id, user_id FROM t_order", &[])
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].data_source, "ds_0");
    assert_eq!(results[1].data_source, "ds_1");
    for (result, expected_id) in results.iter().zip([1, 2]) {
        match &result.outcome {
            ExecuteOutcome::Rows { columns, rows } => {
                assert_eq!(columns, &["order_id", "user_id"]);
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0]["order_id"], expected_id);
            }
            other => panic!("expected rows, got {other:?}"),
        }
    }

    let meta = ctx.metadata();
    // One connection per data source, reused by every statement.
    assert_eq!(meta.connections, 2);
    assert_eq!(meta.statements, 6);
    assert_eq!(meta.result_cursors, 2);

    ctx.finish().await.unwrap();
    registry.close_all().await;
}

#[tokio::test]
async fn test_several_statements_on_single_connection_pool() {
    let dir = TempDir::new().unwrap();
    let registry = setup(dir.path(), &["ds_0"], 1).await;
    let handler = handler(&registry);

    let ctx = ExecutionContext::new();
    let first = handler.execute(&ctx, "SELECT 1 AS one", &[]).await.unwrap();
    let second = handler.execute(&ctx, "SELECT 2 AS two", &[]).await.unwrap();
    let third = handler
        .execute(&ctx, "CREATE TABLE t_item (item_id INTEGER)", &[])
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert!(matches!(third[0].outcome, ExecuteOutcome::Update { .. }));
    assert_eq!(ctx.resources().connection_count(), 1);
    ctx.finish().await.unwrap();

    // The connection went back to the pool at teardown.
    let ctx = ExecutionContext::new();
    handler.execute(&ctx, "SELECT 3", &[]).await.unwrap();
    ctx.finish().await.unwrap();

    registry.close_all().await;
}

#[tokio::test]
async fn test_finished_context_returns_connections_to_pool() {
    let dir = TempDir::new().unwrap();
    let registry = setup(dir.path(), &["ds_0"], 1).await;
    let handler = handler(&registry);

    // Each pool holds a single connection, so every context after the first
    // only succeeds if the previous one gave its connection back.
    for _ in 0..3 {
        let ctx = ExecutionContext::new();
        handler.execute(&ctx, "SELECT 1 AS one", &[]).await.unwrap();
        ctx.finish().await.unwrap();
    }

    registry.close_all().await;
}

#[tokio::test]
async fn test_failed_statement_still_releases_connection() {
    let dir = TempDir::new().unwrap();
    let registry = setup(dir.path(), &["ds_0"], 1).await;
    let handler = handler(&registry);

    let ctx = ExecutionContext::new();
    let err = handler
        .execute(&ctx, "SELECT * FROM no_such_table", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Database { .. }));
    ctx.finish().await.unwrap();

    let ctx = ExecutionContext::new();
    handler.execute(&ctx, "SELECT 1", &[]).await.unwrap();
    ctx.finish().await.unwrap();

    registry.close_all().await;
}

#[tokio::test]
async fn test_tracker_over_sqlx_handles() {
    let dir = TempDir::new().unwrap();
    let registry = setup(dir.path(), &["ds_0"], 1).await;
    let pool = registry.get_pool("ds_0").await.unwrap();

    let routing = Arc::new(MasterVisitedState::new());
    let tracker = ResourceTracker::new(routing.clone());

    let connection = ConnectionHandle::acquire(&pool, "ds_0").await.unwrap();
    tracker.add_connection(connection.clone());

    let create = connection
        .prepare("CREATE TABLE t_user (user_id INTEGER)")
        .await
        .unwrap();
    tracker.add_statement(create.clone());
    connection.execute(&create).await.unwrap();
    routing.mark_master_visited();

    let select = connection.prepare("SELECT user_id FROM t_user").await.unwrap();
    tracker.add_statement(select.clone());
    let cursor = connection.open_cursor(&select).await.unwrap();
    tracker.add_result_cursor(cursor.clone());

    // The backend closed this statement itself before teardown.
    create.close().await.unwrap();

    tracker.release_all().await.unwrap();
    assert!(connection.is_closed());
    assert!(select.is_closed());
    assert!(cursor.is_closed());
    assert!(!routing.is_master_visited());

    // The pool's only connection is available again.
    let again = ConnectionHandle::acquire(&pool, "ds_0").await.unwrap();
    again.close().await.unwrap();
    registry.close_all().await;
}
