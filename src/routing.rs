//! Routing state scoped to one execution context.
//!
//! Once a context has sent a write to the primary data source, its later
//! reads must be routed to the primary as well. The flag recording that lives
//! on the context itself, so clearing it is a plain method call with no
//! cross-context coupling.

use std::sync::atomic::{AtomicBool, Ordering};

/// Per-context routing state the resource tracker resets during teardown.
pub trait ExecutionContextState: Send + Sync {
    /// Forget any cached read/write routing decision of this context.
    fn clear_routing_state(&self);
}

/// Tracks whether the current execution context has visited the primary.
#[derive(Debug, Default)]
pub struct MasterVisitedState {
    master_visited: AtomicBool,
}

impl MasterVisitedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that this context was routed to the primary.
    pub fn mark_master_visited(&self) {
        self.master_visited.store(true, Ordering::Release);
    }

    pub fn is_master_visited(&self) -> bool {
        self.master_visited.load(Ordering::Acquire)
    }
}

impl ExecutionContextState for MasterVisitedState {
    fn clear_routing_state(&self) {
        self.master_visited.store(false, Ordering::Release);
    }
}
