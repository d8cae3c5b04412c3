//! Execution context: the scope of one client session or SQL execution.
//!
//! A context owns its routing state and the [`ResourceTracker`] for every
//! resource opened on its behalf. It is created when the unit of work starts
//! and consumed by [`ExecutionContext::finish`] when it ends, on success,
//! error or client disconnect alike.

use crate::db::{ConnectionHandle, DbPool};
use crate::error::{ProxyError, ProxyResult, ReleaseError};
use crate::resource::{ResourceHandle, ResourceTracker};
use crate::routing::MasterVisitedState;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Connection slot of one data source; the async lock serializes acquisition.
type ConnectionSlot = Arc<tokio::sync::Mutex<Option<ConnectionHandle>>>;

/// Snapshot of an execution context for logging and diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ContextMetadata {
    pub context_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_secs: u64,
    pub connections: usize,
    pub statements: usize,
    pub result_cursors: usize,
    pub master_visited: bool,
}

#[derive(Debug)]
pub struct ExecutionContext {
    id: String,
    started_at: DateTime<Utc>,
    created_at: Instant,
    routing_state: Arc<MasterVisitedState>,
    resources: ResourceTracker,
    connections: std::sync::Mutex<HashMap<String, ConnectionSlot>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        let routing_state = Arc::new(MasterVisitedState::new());
        let resources = ResourceTracker::new(routing_state.clone());
        let id = generate_context_id();
        debug!(context_id = %id, "Execution context started");
        Self {
            id,
            started_at: Utc::now(),
            created_at: Instant::now(),
            routing_state,
            resources,
            connections: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn routing_state(&self) -> &MasterVisitedState {
        &self.routing_state
    }

    /// Tracker for resources opened on behalf of this context.
    pub fn resources(&self) -> &ResourceTracker {
        &self.resources
    }

    /// Connection to `data_source` for this context.
    ///
    /// The first call acquires it from `pool` and registers it with the
    /// tracker; later statements on the same data source reuse it until the
    /// context finishes. A connection that was closed or broke is replaced.
    pub async fn connection(
        &self,
        data_source: &str,
        pool: &DbPool,
    ) -> ProxyResult<ConnectionHandle> {
        let slot = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(data_source.to_string())
            .or_default()
            .clone();

        let mut slot = slot.lock().await;
        if let Some(connection) = slot.as_ref() {
            if !connection.is_closed() && !connection.is_broken() {
                return Ok(connection.clone());
            }
        }

        let connection = ConnectionHandle::acquire(pool, data_source).await?;
        self.resources.add_connection(connection.clone());
        *slot = Some(connection.clone());
        Ok(connection)
    }

    pub fn metadata(&self) -> ContextMetadata {
        ContextMetadata {
            context_id: self.id.clone(),
            started_at: self.started_at,
            duration_secs: self.created_at.elapsed().as_secs(),
            connections: self.resources.connection_count(),
            statements: self.resources.statement_count(),
            result_cursors: self.resources.result_cursor_count(),
            master_visited: self.routing_state.is_master_visited(),
        }
    }

    /// End the context and release everything it opened.
    pub async fn finish(self) -> Result<(), ReleaseError> {
        let pending = self.resources.pending_count();
        let result = self.resources.release_all().await;
        match &result {
            Ok(()) => info!(
                context_id = %self.id,
                resources = pending,
                elapsed_ms = self.created_at.elapsed().as_millis() as u64,
                "Execution context finished"
            ),
            Err(e) => warn!(
                context_id = %self.id,
                resources = pending,
                failures = e.failure_count(),
                error = %e,
                "Execution context finished with close failures"
            ),
        }
        result
    }

    /// Like [`finish`](Self::finish), giving up after `limit`.
    ///
    /// Close calls still pending when the limit elapses are abandoned.
    pub async fn finish_with_timeout(self, limit: Duration) -> ProxyResult<()> {
        let id = self.id.clone();
        match tokio::time::timeout(limit, self.finish()).await {
            Ok(result) => result.map_err(ProxyError::from),
            Err(_) => {
                warn!(context_id = %id, "Execution context release timed out");
                Err(ProxyError::timeout("execution context release", limit.as_secs()))
            }
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        // Closing is async and cannot run here.
        let pending = self.resources.pending_count();
        if pending > 0 {
            warn!(
                context_id = %self.id,
                resources = pending,
                "Execution context dropped without releasing its resources"
            );
        }
    }
}

/// Generate a unique context ID.
fn generate_context_id() -> String {
    format!("ctx_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CloseError;
    use crate::resource::ResourceKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct SlowHandle {
        closed: AtomicBool,
    }

    #[async_trait]
    impl ResourceHandle for SlowHandle {
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn close(&self) -> Result<(), CloseError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct BrokenHandle;

    #[async_trait]
    impl ResourceHandle for BrokenHandle {
        fn is_closed(&self) -> bool {
            false
        }

        async fn close(&self) -> Result<(), CloseError> {
            Err(CloseError::new(ResourceKind::Connection, "network down"))
        }
    }

    async fn memory_pool() -> DbPool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        DbPool::SQLite(pool)
    }

    #[tokio::test]
    async fn test_connection_reused_per_data_source() {
        let pool = memory_pool().await;
        let ctx = ExecutionContext::new();

        // A single-connection pool only serves the second call if it is reused.
        let first = ctx.connection("ds_0", &pool).await.unwrap();
        let second = ctx.connection("ds_0", &pool).await.unwrap();
        assert_eq!(ctx.resources().connection_count(), 1);

        second.close().await.unwrap();
        assert!(first.is_closed());
        ctx.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_connection_replaced() {
        let pool = memory_pool().await;
        let ctx = ExecutionContext::new();

        let first = ctx.connection("ds_0", &pool).await.unwrap();
        first.close().await.unwrap();

        let replacement = ctx.connection("ds_0", &pool).await.unwrap();
        assert!(!replacement.is_closed());
        assert_eq!(ctx.resources().connection_count(), 2);

        ctx.finish().await.unwrap();
        assert!(replacement.is_closed());
    }

    #[test]
    fn test_context_id_format() {
        let ctx = ExecutionContext::new();
        assert!(ctx.id().starts_with("ctx_"));
        assert_eq!(ctx.id().len(), 4 + 32);
    }

    #[test]
    fn test_context_ids_unique() {
        assert_ne!(ExecutionContext::new().id(), ExecutionContext::new().id());
    }

    #[tokio::test]
    async fn test_metadata_counts_resources() {
        let ctx = ExecutionContext::new();
        ctx.resources().add_connection(BrokenHandle);
        ctx.routing_state().mark_master_visited();

        let meta = ctx.metadata();
        assert_eq!(meta.connections, 1);
        assert_eq!(meta.statements, 0);
        assert!(meta.master_visited);
        assert!(ctx.finish().await.is_err());
    }

    #[tokio::test]
    async fn test_finish_reports_close_failures() {
        let ctx = ExecutionContext::new();
        ctx.resources().add_connection(BrokenHandle);
        let err = ctx.finish().await.unwrap_err();
        assert_eq!(err.first().message(), "network down");
    }

    #[tokio::test]
    async fn test_finish_clears_routing_per_cursor() {
        let ctx = ExecutionContext::new();
        let routing = ctx.routing_state.clone();
        routing.mark_master_visited();
        ctx.resources().add_result_cursor(SlowHandle {
            closed: AtomicBool::new(true),
        });

        ctx.finish().await.unwrap();
        assert!(!routing.is_master_visited());
    }

    #[tokio::test]
    async fn test_finish_without_cursors_keeps_routing_state() {
        let ctx = ExecutionContext::new();
        let routing = ctx.routing_state.clone();
        routing.mark_master_visited();

        ctx.finish().await.unwrap();
        assert!(routing.is_master_visited());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_with_timeout_elapses() {
        let ctx = ExecutionContext::new();
        ctx.resources().add_connection(SlowHandle {
            closed: AtomicBool::new(false),
        });

        let err = ctx
            .finish_with_timeout(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Timeout { .. }));
    }
}
