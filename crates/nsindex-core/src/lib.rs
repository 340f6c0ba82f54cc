//! Core types for the namespace index.
//!
//! This crate provides:
//! - [`IndexPath`]: dotted paths split into segments once, at intake
//! - [`Namespace`] and [`IndexedTask`] rows with their merge rules
//! - Completion event payload parsing and validation
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
pub mod event;
pub mod metrics;
pub mod model;
pub mod path;

/// Route prefix that marks a route as an index route (`index.<path>`).
pub const DEFAULT_ROUTE_PREFIX: &str = "index";

pub use error::{Error, Result};
pub use event::{IndexRequest, SkippedRoute, TaskEvent, TaskStatus, parse_event};
pub use model::{IndexedTask, Namespace, Resolution, Row};
pub use path::IndexPath;
