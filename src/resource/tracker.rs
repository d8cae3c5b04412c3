//! Resource tracker for one execution context.
//!
//! The tracker records every connection, statement and result cursor opened
//! while one client session or SQL execution is serviced, and releases all of
//! them in a single teardown.
//!
//! # Concurrency Safety
//!
//! - Registration takes `&self`; each sequence is a `std::sync::Mutex<Vec<_>>`
//!   so concurrent workers of the same context can append without lost updates
//! - Teardown drains the sequences under the lock and closes handles after the
//!   lock is released; no lock is held across an await point
//! - A second teardown only sees handles registered after the first one
//!
//! # Teardown Order
//!
//! 1. Statements, so drivers never see a connection closed under an open statement
//! 2. Connections, in registration order
//! 3. Result cursors, in registration order; the routing state is cleared after
//!    every cursor processed

use crate::error::{CloseError, ReleaseError};
use crate::resource::{ResourceHandle, ResourceKind};
use crate::routing::ExecutionContextState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

type Handles = Mutex<Vec<Box<dyn ResourceHandle>>>;

pub struct ResourceTracker {
    connections: Handles,
    statements: Handles,
    result_cursors: Handles,
    released: AtomicBool,
    routing_state: Arc<dyn ExecutionContextState>,
}

impl ResourceTracker {
    /// Create an empty tracker bound to the routing state of its execution context.
    pub fn new(routing_state: Arc<dyn ExecutionContextState>) -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
            statements: Mutex::new(Vec::new()),
            result_cursors: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
            routing_state,
        }
    }

    /// Register an opened connection.
    pub fn add_connection(&self, handle: impl ResourceHandle + 'static) {
        self.register(&self.connections, ResourceKind::Connection, Box::new(handle));
    }

    /// Register an opened statement.
    pub fn add_statement(&self, handle: impl ResourceHandle + 'static) {
        self.register(&self.statements, ResourceKind::Statement, Box::new(handle));
    }

    /// Register an opened result cursor. Safe to call from concurrent workers.
    pub fn add_result_cursor(&self, handle: impl ResourceHandle + 'static) {
        self.register(
            &self.result_cursors,
            ResourceKind::ResultCursor,
            Box::new(handle),
        );
    }

    fn register(&self, list: &Handles, kind: ResourceKind, handle: Box<dyn ResourceHandle>) {
        if self.is_released() {
            // Recorded anyway; a later release still closes it.
            warn!(kind = %kind, "Resource registered after release");
        }
        lock(list).push(handle);
    }

    /// Close every tracked resource that is still open.
    ///
    /// Every registered resource gets exactly one close attempt, whatever
    /// happened to the ones before it. All close failures are returned
    /// together once the whole teardown has run; the sequences are emptied
    /// either way.
    pub async fn release_all(&self) -> Result<(), ReleaseError> {
        self.released.store(true, Ordering::Release);

        let statements = std::mem::take(&mut *lock(&self.statements));
        let connections = std::mem::take(&mut *lock(&self.connections));
        let result_cursors = std::mem::take(&mut *lock(&self.result_cursors));

        let mut failures = Vec::new();
        let mut closed = 0usize;

        for (index, handle) in statements.iter().enumerate() {
            closed += close_one(&**handle, ResourceKind::Statement, index, &mut failures).await;
        }
        for (index, handle) in connections.iter().enumerate() {
            closed += close_one(&**handle, ResourceKind::Connection, index, &mut failures).await;
        }
        for (index, handle) in result_cursors.iter().enumerate() {
            closed += close_one(&**handle, ResourceKind::ResultCursor, index, &mut failures).await;
            // Once per cursor, not once per teardown.
            self.routing_state.clear_routing_state();
        }

        debug!(
            statements = statements.len(),
            connections = connections.len(),
            result_cursors = result_cursors.len(),
            closed = closed,
            failed = failures.len(),
            "Released execution context resources"
        );

        match ReleaseError::from_failures(failures) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Whether `release_all` has run at least once.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn statement_count(&self) -> usize {
        lock(&self.statements).len()
    }

    pub fn result_cursor_count(&self) -> usize {
        lock(&self.result_cursors).len()
    }

    /// Number of handles waiting for teardown.
    pub fn pending_count(&self) -> usize {
        self.connection_count() + self.statement_count() + self.result_cursor_count()
    }
}

impl std::fmt::Debug for ResourceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceTracker")
            .field("connections", &self.connection_count())
            .field("statements", &self.statement_count())
            .field("result_cursors", &self.result_cursor_count())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Lock a handle list, recovering it if a registering thread panicked.
fn lock(list: &Handles) -> MutexGuard<'_, Vec<Box<dyn ResourceHandle>>> {
    list.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Close one handle unless it is already closed. Returns 1 if a close was attempted.
async fn close_one(
    handle: &dyn ResourceHandle,
    kind: ResourceKind,
    index: usize,
    failures: &mut Vec<CloseError>,
) -> usize {
    if handle.is_closed() {
        return 0;
    }
    if let Err(e) = handle.close().await {
        warn!(kind = %kind, index = index, error = %e, "Failed to close resource");
        failures.push(e);
    }
    1
}
