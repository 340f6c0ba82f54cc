//! In-memory table.
//!
//! Rows live in a `BTreeMap` keyed by the same byte encoding as the RocksDB
//! table, so listings come back in the same order. A single mutex makes every
//! operation atomic.

use super::{Page, Table, check_continuation};
use crate::Result;
use nsindex_core::{IndexPath, Row};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Table kept entirely in process memory.
pub struct MemoryTable<R> {
    name: String,
    rows: Mutex<BTreeMap<Vec<u8>, R>>,
}

impl<R: Row> MemoryTable<R> {
    /// Create an empty table.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    /// Whether the table holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    fn range(&self, start: Bound<Vec<u8>>, prefix: &[u8], limit: usize) -> Page<R> {
        let rows = self.rows.lock();
        let found: Vec<R> = rows
            .range((start, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .take(limit + 1)
            .map(|(_, row)| row.clone())
            .collect();
        Page::from_lookahead(found, limit)
    }
}

impl<R: Row> Table<R> for MemoryTable<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, path: &IndexPath) -> Result<Option<R>> {
        Ok(self.rows.lock().get(&path.storage_key()).cloned())
    }

    fn upsert(
        &self,
        path: &IndexPath,
        update: &mut dyn FnMut(Option<&R>) -> Option<R>,
    ) -> Result<Option<R>> {
        let key = path.storage_key();
        let mut rows = self.rows.lock();
        let next = update(rows.get(&key));
        if let Some(row) = &next {
            rows.insert(key, row.clone());
        }
        Ok(next)
    }

    fn delete(&self, path: &IndexPath) -> Result<()> {
        self.rows.lock().remove(&path.storage_key());
        Ok(())
    }

    fn delete_if(
        &self,
        path: &IndexPath,
        predicate: &mut dyn FnMut(&R) -> bool,
    ) -> Result<bool> {
        let key = path.storage_key();
        let mut rows = self.rows.lock();
        let matched = rows.get(&key).is_some_and(|row| predicate(row));
        if matched {
            rows.remove(&key);
        }
        Ok(matched)
    }

    fn list(
        &self,
        parent: &IndexPath,
        after: Option<&IndexPath>,
        limit: usize,
    ) -> Result<Page<R>> {
        check_continuation(parent, after)?;
        let prefix = parent.children_prefix();
        let start = match after {
            Some(after) => Bound::Excluded(after.storage_key()),
            None => Bound::Included(prefix.clone()),
        };
        Ok(self.range(start, &prefix, limit))
    }

    fn scan(&self, after: Option<&IndexPath>, limit: usize) -> Result<Page<R>> {
        let start = match after {
            Some(after) => Bound::Excluded(after.storage_key()),
            None => Bound::Unbounded,
        };
        Ok(self.range(start, &[], limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use nsindex_core::Namespace;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 1, day, 0, 0, 0).unwrap()
    }

    fn path(s: &str) -> IndexPath {
        IndexPath::parse(s).unwrap()
    }

    fn put(table: &MemoryTable<Namespace>, p: &str, day: u32) {
        let row = Namespace::new(path(p), at(day));
        table.upsert(&path(p), &mut |_| Some(row.clone())).unwrap();
    }

    #[test]
    fn test_upsert_and_get() {
        let table = MemoryTable::new("namespaces");
        assert!(table.get(&path("a")).unwrap().is_none());

        put(&table, "a", 1);
        assert_eq!(table.get(&path("a")).unwrap().unwrap().expires, at(1));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_upsert_none_leaves_row() {
        let table = MemoryTable::new("namespaces");
        put(&table, "a", 1);

        let written = table.upsert(&path("a"), &mut |_| None).unwrap();
        assert!(written.is_none());
        assert_eq!(table.get(&path("a")).unwrap().unwrap().expires, at(1));
    }

    #[test]
    fn test_delete_if() {
        let table = MemoryTable::new("namespaces");
        put(&table, "a", 5);

        assert!(!table.delete_if(&path("a"), &mut |row| row.expires < at(5)).unwrap());
        assert!(table.delete_if(&path("a"), &mut |row| row.expires < at(6)).unwrap());
        assert!(table.is_empty());
        assert!(!table.delete_if(&path("a"), &mut |_| true).unwrap());
    }

    #[test]
    fn test_list_direct_children_only() {
        let table = MemoryTable::new("namespaces");
        for p in ["a", "a.x", "a.y", "a.x.deep", "ab", "ab.z"] {
            put(&table, p, 1);
        }

        let page = table.list(&path("a"), None, 10).unwrap();
        let names: Vec<&str> = page.rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["x", "y"]);
        assert!(page.continuation.is_none());

        let top = table.list(&IndexPath::root(), None, 10).unwrap();
        let names: Vec<&str> = top.rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "ab"]);
    }

    #[test]
    fn test_list_pagination() {
        let table = MemoryTable::new("namespaces");
        for p in ["p.a", "p.b", "p.c"] {
            put(&table, p, 1);
        }

        let first = table.list(&path("p"), None, 2).unwrap();
        assert_eq!(first.rows.len(), 2);
        let next = first.continuation.unwrap();
        assert_eq!(next, path("p.b"));

        let second = table.list(&path("p"), Some(&next), 2).unwrap();
        assert_eq!(second.rows.len(), 1);
        assert_eq!(second.rows[0].name, "c");
        assert!(second.continuation.is_none());
    }

    #[test]
    fn test_scan_everything() {
        let table = MemoryTable::new("namespaces");
        for p in ["a", "a.b", "a.b.c", "z"] {
            put(&table, p, 1);
        }
        let page = table.scan(None, 100).unwrap();
        assert_eq!(page.rows.len(), 4);
    }
}
