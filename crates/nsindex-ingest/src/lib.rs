//! Namespace indexing service components.
//!
//! Completion events for finished task runs declare routes such as
//! `index.gecko.v2.latest.linux64`. This crate turns those routes into a
//! browsable hierarchy: every proper prefix becomes a namespace row and the
//! full path becomes an indexed task row pointing at the run.
//!
//! # Modules
//!
//! - [`consumer`] - Bounded worker pool pulling deliveries, with explicit ack/requeue
//! - [`indexer`] - Applies one event to both tables
//! - [`store`] - Table contract plus RocksDB and in-memory implementations
//! - [`sweeper`] - Periodic removal of expired rows
//! - [`reader`] - Read-only lookups for query surfaces
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Subscription   │  (broker queue, JSONL replay)
//! └────────┬────────┘
//!          │ Delivery
//!          ▼
//! ┌─────────────────┐
//! │  EventConsumer  │  parse, filter, settle
//! └────────┬────────┘
//!          │ IndexRequest
//!          ▼
//! ┌─────────────────┐       ┌───────────────────┐
//! │     Indexer     │──────▶│ namespaces table  │◀──┐
//! └────────┬────────┘       └───────────────────┘   │
//!          │                ┌───────────────────┐   │ ExpirationSweeper
//!          └───────────────▶│ indexed-tasks     │◀──┘
//!                           └───────────────────┘
//! ```
//!
//! The tables are the only shared state; every write is a per-row
//! compare-and-swap, so any number of consumers may run against them.

pub mod config;
pub mod consumer;
pub mod error;
pub mod indexer;
pub mod reader;
pub mod retry;
pub mod store;
pub mod sweeper;

// Re-export commonly used types at crate root
pub use config::Config;
pub use consumer::{
    ConsumerConfig, ConsumerStats, Delivery, EventConsumer, HandleOutcome, JsonlConfig,
    JsonlSource, JsonlStats, Settlement,
};
pub use error::{Error, Result};
pub use indexer::{IndexReport, Indexer, LeafOutcome, PathReport};
pub use reader::IndexReader;
pub use retry::RetryPolicy;
pub use store::{MemoryTable, Page, RocksTable, RocksTableOptions, Rows, Stores, Table};
pub use sweeper::{ExpirationSweeper, SweepReport, SweepStats, SweeperConfig};
