//! RocksDB-backed table.
//!
//! Each table is its own RocksDB database opened in optimistic-transaction
//! mode. A conditional update reads the row with `get_for_update`, computes
//! the replacement and commits; if another writer committed the same key in
//! between, the commit fails with `Busy` and the update is re-run against the
//! fresh row.
//!
//! # Key Design
//!
//! ```text
//! Key:   [dotted parent path][0x00][last segment]
//! Value: JSON-encoded row
//! ```
//!
//! Direct children of a path are a contiguous key range, so child listings
//! and full scans are plain forward iterations.

use super::{Page, Table, check_continuation};
use crate::{Error, Result};
use nsindex_core::{IndexPath, Row};
use rocksdb::{Direction, IteratorMode, MultiThreaded, OptimisticTransactionDB, Options};
use std::marker::PhantomData;
use std::path::Path;
use tracing::{debug, info};

/// Tuning for a [`RocksTable`].
#[derive(Debug, Clone)]
pub struct RocksTableOptions {
    /// How many times a conditional update is re-run after losing a
    /// commit race before giving up with [`Error::Conflict`].
    pub max_conflict_retries: u32,

    /// Memtable size in bytes.
    pub write_buffer_size: usize,
}

impl Default for RocksTableOptions {
    fn default() -> Self {
        Self {
            max_conflict_retries: 16,
            write_buffer_size: 32 * 1024 * 1024, // 32MB
        }
    }
}

/// Durable table of rows in a RocksDB optimistic-transaction database.
///
/// Thread-safe: share across tasks via `Arc`.
pub struct RocksTable<R> {
    name: String,
    db: OptimisticTransactionDB<MultiThreaded>,
    max_conflict_retries: u32,
    _row: PhantomData<fn() -> R>,
}

impl<R: Row> RocksTable<R> {
    /// Open or create a table at the given directory.
    pub fn open<P: AsRef<Path>>(path: P, name: &str, options: RocksTableOptions) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening {} table '{}' at {}", R::KIND, name, path.display());

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(options.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        // Point lookups dominate: bloom filters for fast "not found"
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        block_opts.set_cache_index_and_filter_blocks(true);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.increase_parallelism(num_cpus::get().min(4) as i32);

        let db = OptimisticTransactionDB::<MultiThreaded>::open(&opts, path)?;

        Ok(Self {
            name: name.to_string(),
            db,
            max_conflict_retries: options.max_conflict_retries.max(1),
            _row: PhantomData,
        })
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn decode(&self, key: &[u8], value: &[u8]) -> Result<R> {
        serde_json::from_slice(value).map_err(|source| Error::Corrupt {
            table: self.name.clone(),
            key: String::from_utf8_lossy(key).replace('\0', "/"),
            source,
        })
    }

    fn encode(row: &R) -> Result<Vec<u8>> {
        serde_json::to_vec(row).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn conflict(&self, path: &IndexPath) -> Error {
        Error::Conflict {
            table: self.name.clone(),
            path: path.to_string(),
            attempts: self.max_conflict_retries,
        }
    }

    /// Rows in key order from `start`, limited to keys beginning with `prefix`.
    fn range(&self, start: &[u8], exclusive: bool, prefix: &[u8], limit: usize) -> Result<Page<R>> {
        let mut rows = Vec::new();

        let iter = self
            .db
            .iterator(IteratorMode::From(start, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            if exclusive && key.as_ref() == start {
                continue;
            }
            rows.push(self.decode(&key, &value)?);
            if rows.len() > limit {
                break;
            }
        }

        Ok(Page::from_lookahead(rows, limit))
    }
}

fn is_write_conflict(e: &rocksdb::Error) -> bool {
    matches!(
        e.kind(),
        rocksdb::ErrorKind::Busy | rocksdb::ErrorKind::TryAgain
    )
}

impl<R: Row> Table<R> for RocksTable<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, path: &IndexPath) -> Result<Option<R>> {
        let key = path.storage_key();
        self.db
            .get(&key)?
            .map(|value| self.decode(&key, &value))
            .transpose()
    }

    fn upsert(
        &self,
        path: &IndexPath,
        update: &mut dyn FnMut(Option<&R>) -> Option<R>,
    ) -> Result<Option<R>> {
        let key = path.storage_key();

        for attempt in 1..=self.max_conflict_retries {
            let txn = self.db.transaction();
            let current = txn
                .get_for_update(&key, true)?
                .map(|value| self.decode(&key, &value))
                .transpose()?;

            // Dropping the transaction without committing rolls it back
            let Some(next) = update(current.as_ref()) else {
                return Ok(None);
            };

            txn.put(&key, Self::encode(&next)?)?;
            match txn.commit() {
                Ok(()) => return Ok(Some(next)),
                Err(e) if is_write_conflict(&e) => {
                    debug!(
                        "{}: write conflict on '{}' (attempt {})",
                        self.name, path, attempt
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(self.conflict(path))
    }

    fn delete(&self, path: &IndexPath) -> Result<()> {
        self.db.delete(path.storage_key())?;
        Ok(())
    }

    fn delete_if(
        &self,
        path: &IndexPath,
        predicate: &mut dyn FnMut(&R) -> bool,
    ) -> Result<bool> {
        let key = path.storage_key();

        for attempt in 1..=self.max_conflict_retries {
            let txn = self.db.transaction();
            let Some(value) = txn.get_for_update(&key, true)? else {
                return Ok(false);
            };
            if !predicate(&self.decode(&key, &value)?) {
                return Ok(false);
            }

            txn.delete(&key)?;
            match txn.commit() {
                Ok(()) => return Ok(true),
                Err(e) if is_write_conflict(&e) => {
                    debug!(
                        "{}: delete conflict on '{}' (attempt {})",
                        self.name, path, attempt
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(self.conflict(path))
    }

    fn list(
        &self,
        parent: &IndexPath,
        after: Option<&IndexPath>,
        limit: usize,
    ) -> Result<Page<R>> {
        check_continuation(parent, after)?;
        let prefix = parent.children_prefix();
        match after {
            Some(after) => self.range(&after.storage_key(), true, &prefix, limit),
            None => self.range(&prefix, false, &prefix, limit),
        }
    }

    fn scan(&self, after: Option<&IndexPath>, limit: usize) -> Result<Page<R>> {
        match after {
            Some(after) => self.range(&after.storage_key(), true, &[], limit),
            None => self.range(&[], false, &[], limit),
        }
    }
}
