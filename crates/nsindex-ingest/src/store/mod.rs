//! Keyed tables holding the index rows.
//!
//! - [`Table`] - the contract every store implements
//! - [`RocksTable`] - durable table on a RocksDB optimistic-transaction database
//! - [`MemoryTable`] - in-process table for tests and throwaway deployments
//!
//! # Atomicity
//!
//! [`Table::upsert`] and [`Table::delete_if`] are compare-and-swap operations:
//! the closure sees the current row and its decision is applied only if no
//! other writer changed that row in between. This is the only synchronization
//! between concurrent indexers, including indexers in other processes sharing
//! the same store. The closures may run more than once and must be pure.
//!
//! Operations on distinct paths are not ordered with respect to each other.

mod memory;
mod rocks;
#[cfg(test)]
pub(crate) mod testing;

pub use memory::MemoryTable;
pub use rocks::{RocksTable, RocksTableOptions};

use crate::Result;
use nsindex_core::{IndexPath, IndexedTask, Namespace, Row};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

/// A keyed table of rows addressed by [`IndexPath`].
pub trait Table<R: Row>: Send + Sync {
    /// Table name, for logs and metric labels.
    fn name(&self) -> &str;

    /// The row at `path`, if any.
    fn get(&self, path: &IndexPath) -> Result<Option<R>>;

    /// Atomically replace the row at `path` with `update(current)`.
    ///
    /// `update` returns `None` to leave the row unchanged. Returns the row
    /// that was written, if any.
    fn upsert(
        &self,
        path: &IndexPath,
        update: &mut dyn FnMut(Option<&R>) -> Option<R>,
    ) -> Result<Option<R>>;

    /// Remove the row at `path` unconditionally.
    fn delete(&self, path: &IndexPath) -> Result<()>;

    /// Atomically remove the row at `path` if `predicate` holds for it.
    ///
    /// Returns whether a row was removed.
    fn delete_if(&self, path: &IndexPath, predicate: &mut dyn FnMut(&R) -> bool)
    -> Result<bool>;

    /// Direct children of `parent`, ordered by name, starting after `after`.
    fn list(&self, parent: &IndexPath, after: Option<&IndexPath>, limit: usize)
    -> Result<Page<R>>;

    /// All rows in key order, starting after `after`.
    fn scan(&self, after: Option<&IndexPath>, limit: usize) -> Result<Page<R>>;
}

/// Shared handle to the namespace table.
pub type NamespaceStore = Arc<dyn Table<Namespace>>;

/// Shared handle to the indexed task table.
pub type IndexedTaskStore = Arc<dyn Table<IndexedTask>>;

/// One page of a listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<R> {
    pub rows: Vec<R>,
    /// Pass back as `after` to fetch the next page; `None` on the last page.
    pub continuation: Option<IndexPath>,
}

impl<R: Row> Page<R> {
    /// Build a page from up to `limit + 1` rows fetched in key order.
    pub(crate) fn from_lookahead(mut rows: Vec<R>, limit: usize) -> Self {
        let continuation = if rows.len() > limit {
            rows.truncate(limit);
            rows.last().map(|row| row.path().clone())
        } else {
            None
        };
        Self { rows, continuation }
    }
}

/// Check that a listing continuation is a child of the listed parent.
pub(crate) fn check_continuation(parent: &IndexPath, after: Option<&IndexPath>) -> Result<()> {
    match after {
        Some(after) if !parent.is_parent_of(after) => Err(crate::Error::InvalidContinuation {
            prefix: parent.to_string(),
            continuation: after.to_string(),
        }),
        _ => Ok(()),
    }
}

enum Cursor {
    Scan,
    Children(IndexPath),
}

/// Lazy, page-at-a-time iteration over a table.
///
/// Restartable: [`Rows::position`] is the last row yielded and can seed a
/// new iterator via [`Rows::resume`].
pub struct Rows<'a, R: Row> {
    table: &'a dyn Table<R>,
    cursor: Cursor,
    after: Option<IndexPath>,
    buffer: VecDeque<R>,
    page_size: usize,
    exhausted: bool,
}

impl<'a, R: Row> Rows<'a, R> {
    /// Iterate every row of `table`.
    pub fn all(table: &'a dyn Table<R>, page_size: usize) -> Self {
        Self::new(table, Cursor::Scan, page_size)
    }

    /// Iterate the direct children of `parent`.
    pub fn children(table: &'a dyn Table<R>, parent: IndexPath, page_size: usize) -> Self {
        Self::new(table, Cursor::Children(parent), page_size)
    }

    fn new(table: &'a dyn Table<R>, cursor: Cursor, page_size: usize) -> Self {
        Self {
            table,
            cursor,
            after: None,
            buffer: VecDeque::new(),
            page_size: page_size.max(1),
            exhausted: false,
        }
    }

    /// Continue after `position` instead of from the beginning.
    pub fn resume(mut self, position: Option<IndexPath>) -> Self {
        self.after = position;
        self
    }

    /// The last row handed out so far.
    pub fn position(&self) -> Option<&IndexPath> {
        self.after.as_ref()
    }

    fn fill(&mut self) -> Result<()> {
        let page = match &self.cursor {
            Cursor::Scan => self.table.scan(self.after.as_ref(), self.page_size)?,
            Cursor::Children(parent) => {
                self.table
                    .list(parent, self.after.as_ref(), self.page_size)?
            }
        };
        self.exhausted = page.continuation.is_none();
        self.buffer.extend(page.rows);
        Ok(())
    }
}

impl<R: Row> Iterator for Rows<'_, R> {
    type Item = Result<R>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        let row = self.buffer.pop_front()?;
        self.after = Some(row.path().clone());
        Some(Ok(row))
    }
}

/// Both index tables, passed explicitly to every component that needs them.
#[derive(Clone)]
pub struct Stores {
    pub namespaces: NamespaceStore,
    pub tasks: IndexedTaskStore,
}

impl Stores {
    /// Open RocksDB tables under `data_dir`, one directory per table name.
    pub fn open_rocks(
        data_dir: &Path,
        namespace_table: &str,
        indexed_task_table: &str,
    ) -> Result<Self> {
        let namespaces: RocksTable<Namespace> = RocksTable::open(
            data_dir.join(namespace_table),
            namespace_table,
            RocksTableOptions::default(),
        )?;
        let tasks: RocksTable<IndexedTask> = RocksTable::open(
            data_dir.join(indexed_task_table),
            indexed_task_table,
            RocksTableOptions::default(),
        )?;
        Ok(Self {
            namespaces: Arc::new(namespaces),
            tasks: Arc::new(tasks),
        })
    }

    /// Fresh in-memory tables.
    pub fn in_memory() -> Self {
        Self {
            namespaces: Arc::new(MemoryTable::new("namespaces")),
            tasks: Arc::new(MemoryTable::new("indexed-tasks")),
        }
    }
}
