//! Table wrappers that inject failures and stalls into tests.

use super::{MemoryTable, Page, Table};
use crate::{Error, Result};
use nsindex_core::{IndexPath, Row};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::time::Duration;
use tokio::sync::Notify;

/// Fails the first `failures` upserts, then behaves like a memory table.
pub(crate) struct Flaky<R: Row> {
    inner: MemoryTable<R>,
    failures: AtomicU32,
    calls: AtomicU32,
    permanent: bool,
}

impl<R: Row> Flaky<R> {
    /// Failures are transient (`Unavailable`).
    pub(crate) fn new(failures: u32) -> Self {
        Self::build(failures, false)
    }

    /// Failures are permanent (`Serialization`).
    pub(crate) fn permanent(failures: u32) -> Self {
        Self::build(failures, true)
    }

    fn build(failures: u32, permanent: bool) -> Self {
        Self {
            inner: MemoryTable::new("flaky"),
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
            permanent,
        }
    }

    /// Upserts attempted so far.
    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn trip(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let tripped = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        match (tripped, self.permanent) {
            (false, _) => Ok(()),
            (true, false) => Err(Error::Unavailable("injected".to_string())),
            (true, true) => Err(Error::Serialization("injected".to_string())),
        }
    }
}

/// Memory table whose upserts block until released.
pub(crate) struct Gated<R: Row> {
    inner: MemoryTable<R>,
    entered: Arc<Notify>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl<R: Row> Gated<R> {
    /// The notify fires when an upsert starts blocking; sending on the
    /// sender lets one upsert through.
    pub(crate) fn new() -> (Self, Arc<Notify>, mpsc::Sender<()>) {
        let entered = Arc::new(Notify::new());
        let (release_tx, release_rx) = mpsc::channel();
        let table = Self {
            inner: MemoryTable::new("gated"),
            entered: Arc::clone(&entered),
            release: Mutex::new(release_rx),
        };
        (table, entered, release_tx)
    }
}

macro_rules! delegate_reads {
    () => {
        fn get(&self, path: &IndexPath) -> Result<Option<R>> {
            self.inner.get(path)
        }

        fn delete(&self, path: &IndexPath) -> Result<()> {
            self.inner.delete(path)
        }

        fn delete_if(
            &self,
            path: &IndexPath,
            predicate: &mut dyn FnMut(&R) -> bool,
        ) -> Result<bool> {
            self.inner.delete_if(path, predicate)
        }

        fn list(
            &self,
            parent: &IndexPath,
            after: Option<&IndexPath>,
            limit: usize,
        ) -> Result<Page<R>> {
            self.inner.list(parent, after, limit)
        }

        fn scan(&self, after: Option<&IndexPath>, limit: usize) -> Result<Page<R>> {
            self.inner.scan(after, limit)
        }
    };
}

impl<R: Row> Table<R> for Flaky<R> {
    fn name(&self) -> &str {
        "flaky"
    }

    fn upsert(
        &self,
        path: &IndexPath,
        update: &mut dyn FnMut(Option<&R>) -> Option<R>,
    ) -> Result<Option<R>> {
        self.trip()?;
        self.inner.upsert(path, update)
    }

    delegate_reads!();
}

impl<R: Row> Table<R> for Gated<R> {
    fn name(&self) -> &str {
        "gated"
    }

    fn upsert(
        &self,
        path: &IndexPath,
        update: &mut dyn FnMut(Option<&R>) -> Option<R>,
    ) -> Result<Option<R>> {
        self.entered.notify_one();
        // Bounded so a forgotten release cannot hang the test binary
        let _ = self.release.lock().recv_timeout(Duration::from_secs(10));
        self.inner.upsert(path, update)
    }

    delegate_reads!();
}
