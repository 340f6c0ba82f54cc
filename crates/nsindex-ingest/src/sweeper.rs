//! Expiration sweeper.
//!
//! Periodically pages through both tables and removes rows whose `expires`
//! lies in the past. Deletes are conditional on the row still being expired,
//! so a row refreshed by the indexer between the scan and the delete is kept.
//! Failures are logged and left for the next cycle.

use crate::store::{Rows, Stores, Table};
use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use nsindex_core::Row;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Sweeper settings.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Time between cycles.
    pub interval: Duration,
    /// Rows fetched per scan page.
    pub batch_size: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            batch_size: 1000,
        }
    }
}

/// Per-table results of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub scanned: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Results of one cycle over both tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub namespaces: SweepStats,
    pub tasks: SweepStats,
}

impl SweepReport {
    pub fn deleted(&self) -> usize {
        self.namespaces.deleted + self.tasks.deleted
    }

    pub fn failed(&self) -> usize {
        self.namespaces.failed + self.tasks.failed
    }
}

/// Deletes expired rows from both tables.
pub struct ExpirationSweeper {
    stores: Stores,
    config: SweeperConfig,
}

impl ExpirationSweeper {
    pub fn new(stores: Stores, config: SweeperConfig) -> Self {
        Self { stores, config }
    }

    /// Run a single cycle against `now`.
    pub fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let started = Instant::now();
        let report = SweepReport {
            namespaces: sweep_table(self.stores.namespaces.as_ref(), now, self.config.batch_size),
            tasks: sweep_table(self.stores.tasks.as_ref(), now, self.config.batch_size),
        };

        histogram!("sweeper_cycle_duration_seconds").record(started.elapsed().as_secs_f64());
        gauge!("sweeper_last_run_unix").set(now.timestamp() as f64);

        tracing::info!(
            "Sweep complete: namespaces {}/{} deleted ({} failed), tasks {}/{} deleted ({} failed)",
            report.namespaces.deleted,
            report.namespaces.scanned,
            report.namespaces.failed,
            report.tasks.deleted,
            report.tasks.scanned,
            report.tasks.failed
        );
        report
    }

    /// Sweep every `interval` until `shutdown` fires.
    ///
    /// The first cycle runs immediately. Cycles run on the blocking pool so
    /// store I/O never stalls the consumer's workers.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "Sweeper started: interval {:?}, batch size {}",
            self.config.interval,
            self.config.batch_size
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let sweeper = Arc::clone(&self);
            let cycle = tokio::task::spawn_blocking(move || sweeper.sweep_once(Utc::now()));
            if let Err(e) = cycle.await {
                tracing::error!("Sweep cycle panicked: {}", e);
            }
        }

        tracing::info!("Sweeper stopped");
    }
}

fn sweep_table<R: Row>(table: &dyn Table<R>, now: DateTime<Utc>, batch_size: usize) -> SweepStats {
    let mut stats = SweepStats::default();

    for row in Rows::all(table, batch_size) {
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!("Sweep of {} stopped early, scan failed: {}", table.name(), e);
                stats.failed += 1;
                break;
            }
        };
        stats.scanned += 1;
        if !row.is_expired(now) {
            continue;
        }
        match table.delete_if(row.path(), &mut |current: &R| current.is_expired(now)) {
            Ok(true) => stats.deleted += 1,
            Ok(false) => {
                tracing::debug!("{} {} refreshed before delete, kept", R::KIND, row.path());
            }
            Err(e) => {
                tracing::warn!("Failed to delete expired {} {}: {}", R::KIND, row.path(), e);
                stats.failed += 1;
            }
        }
    }

    counter!("sweeper_rows_deleted_total", "table" => table.name().to_string())
        .increment(stats.deleted as u64);
    if stats.failed > 0 {
        counter!("sweeper_failures_total", "table" => table.name().to_string())
            .increment(stats.failed as u64);
    }
    stats
}
