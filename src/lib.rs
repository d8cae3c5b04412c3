//! Proxy Resource Tracker Library
//!
//! This library provides the backend resource layer of a sharding database
//! proxy: every connection, statement and result cursor opened for one
//! execution context is tracked and released exactly once when the context ends.

pub mod backend;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod resource;
pub mod routing;

pub use config::Config;
pub use context::ExecutionContext;
pub use error::{CloseError, ProxyError, ReleaseError};
pub use resource::{ResourceHandle, ResourceKind, ResourceTracker};
pub use routing::{ExecutionContextState, MasterVisitedState};
