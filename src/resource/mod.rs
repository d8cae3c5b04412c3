//! Per-execution-context resource tracking.
//!
//! This module provides:
//! - The [`ResourceHandle`] capability shared by connections, statements and cursors
//! - The [`ResourceTracker`] that registers handles and tears them down exactly once

pub mod tracker;

pub use tracker::ResourceTracker;

use crate::error::CloseError;
use async_trait::async_trait;
use std::sync::Arc;

/// Kind of database resource held by an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Connection,
    Statement,
    ResultCursor,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Statement => "statement",
            Self::ResultCursor => "result cursor",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimal capability of a native resource handle.
///
/// A handle may be closed by its owning subsystem at any time; `close` is only
/// called by the tracker while `is_closed` reports `false`.
#[async_trait]
pub trait ResourceHandle: Send + Sync {
    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<(), CloseError>;
}

#[async_trait]
impl<T: ResourceHandle + ?Sized> ResourceHandle for Arc<T> {
    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }

    async fn close(&self) -> Result<(), CloseError> {
        (**self).close().await
    }
}

#[async_trait]
impl<T: ResourceHandle + ?Sized> ResourceHandle for Box<T> {
    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }

    async fn close(&self) -> Result<(), CloseError> {
        (**self).close().await
    }
}
