//! Turns completion events into index rows.
//!
//! For every path in an [`IndexRequest`] the [`Indexer`]:
//!
//! 1. touches each ancestor namespace, root first, keeping the running
//!    maximum of `expires`;
//! 2. upserts the leaf [`IndexedTask`] under the rank rule: the stored leaf
//!    is replaced when its rank is lower than or equal to the incoming rank,
//!    and kept otherwise.
//!
//! Every step is a conditional update that converges to the same state no
//! matter how often or in which order events are applied, so redelivered and
//! reordered events are harmless. Transient store failures are retried per
//! [`RetryPolicy`]; once retries run out the whole event is reported failed
//! and the caller leaves it unacknowledged.

use crate::Result;
use crate::retry::RetryPolicy;
use crate::store::{IndexedTaskStore, NamespaceStore, Stores};
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use nsindex_core::{IndexPath, IndexRequest, IndexedTask, Namespace, Resolution};
use std::sync::Arc;
use std::time::Instant;

/// What happened to the leaf at one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafOutcome {
    /// No leaf existed; the incoming one was stored.
    Inserted,
    /// The stored leaf had a lower or equal rank and was overwritten.
    Replaced,
    /// The stored leaf outranks the incoming one and was kept.
    RankConflict { stored_rank: i64 },
}

/// Result of indexing one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathReport {
    pub path: IndexPath,
    pub leaf: LeafOutcome,
    /// Ancestor namespaces inserted or whose expiry was extended.
    pub namespaces_written: usize,
}

/// Result of indexing one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexReport {
    pub task_id: String,
    pub paths: Vec<PathReport>,
    /// Index routes that did not form a valid path.
    pub skipped_routes: usize,
}

impl IndexReport {
    /// Number of leaves inserted or replaced.
    pub fn leaves_written(&self) -> usize {
        self.paths
            .iter()
            .filter(|p| !matches!(p.leaf, LeafOutcome::RankConflict { .. }))
            .count()
    }

    /// Number of paths where a higher-ranked leaf was kept.
    pub fn rank_conflicts(&self) -> usize {
        self.paths.len() - self.leaves_written()
    }
}

/// Writes namespace chains and leaves for completion events.
pub struct Indexer {
    namespaces: NamespaceStore,
    tasks: IndexedTaskStore,
    retry: RetryPolicy,
}

impl Indexer {
    /// Create an indexer writing to the given tables.
    pub fn new(stores: Stores, retry: RetryPolicy) -> Self {
        Self {
            namespaces: stores.namespaces,
            tasks: stores.tasks,
            retry,
        }
    }

    /// Index every path of `request`.
    ///
    /// Safe to call any number of times for the same request.
    pub async fn index(&self, request: &IndexRequest) -> Result<IndexReport> {
        let start = Instant::now();

        for skipped in &request.skipped {
            tracing::warn!(
                "Task {}: skipping route '{}': {}",
                request.task_id,
                skipped.route,
                skipped.reason
            );
        }
        if !request.skipped.is_empty() {
            counter!("index_routes_skipped_total").increment(request.skipped.len() as u64);
        }

        let mut paths = Vec::with_capacity(request.paths.len());
        for path in &request.paths {
            paths.push(self.index_path(request, path).await?);
        }

        histogram!("index_event_duration_seconds").record(start.elapsed().as_secs_f64());

        Ok(IndexReport {
            task_id: request.task_id.clone(),
            paths,
            skipped_routes: request.skipped.len(),
        })
    }

    async fn index_path(&self, request: &IndexRequest, path: &IndexPath) -> Result<PathReport> {
        let mut namespaces_written = 0usize;
        for ancestor in path.ancestors() {
            if self.touch_namespace(&ancestor, request.expires).await? {
                namespaces_written += 1;
            }
        }
        counter!("index_namespaces_written_total").increment(namespaces_written as u64);

        let leaf = self.upsert_leaf(request.leaf(path)).await?;
        match leaf {
            LeafOutcome::Inserted | LeafOutcome::Replaced => {
                tracing::debug!(
                    "Indexed task {} at {} (rank {}, {:?})",
                    request.task_id,
                    path,
                    request.rank,
                    leaf
                );
                counter!("index_leaves_written_total").increment(1);
            }
            LeafOutcome::RankConflict { stored_rank } => {
                tracing::info!(
                    "Kept existing entry at {}: stored rank {} > incoming rank {} (task {})",
                    path,
                    stored_rank,
                    request.rank,
                    request.task_id
                );
                counter!("index_rank_conflicts_total").increment(1);
            }
        }

        Ok(PathReport {
            path: path.clone(),
            leaf,
            namespaces_written,
        })
    }

    /// Ensure the namespace at `path` exists and outlives `expires`.
    ///
    /// Returns whether a row was written.
    async fn touch_namespace(&self, path: &IndexPath, expires: DateTime<Utc>) -> Result<bool> {
        let table = Arc::clone(&self.namespaces);
        let path = path.clone();
        let written = self
            .retry
            .run_blocking("upsert namespace", move || {
                table.upsert(&path, &mut |current| Namespace::touch(current, &path, expires))
            })
            .await?;
        Ok(written.is_some())
    }

    /// Apply the rank rule for `leaf` against the stored leaf.
    async fn upsert_leaf(&self, leaf: IndexedTask) -> Result<LeafOutcome> {
        let table = Arc::clone(&self.tasks);
        self.retry
            .run_blocking("upsert indexed task", move || {
                let mut outcome = LeafOutcome::Inserted;
                table.upsert(&leaf.path, &mut |current| match leaf.resolve(current) {
                    Resolution::Insert => {
                        outcome = LeafOutcome::Inserted;
                        Some(leaf.clone())
                    }
                    Resolution::Replace => {
                        outcome = LeafOutcome::Replaced;
                        Some(leaf.clone())
                    }
                    Resolution::RankConflict => {
                        outcome = LeafOutcome::RankConflict {
                            stored_rank: current.map_or(leaf.rank, |c| c.rank),
                        };
                        None
                    }
                })?;
                Ok(outcome)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::store::MemoryTable;
    use crate::store::testing::Flaky;
    use chrono::{Duration, TimeZone};
    use nsindex_core::{TaskEvent, TaskStatus};
    use serde_json::{Value, json};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn path(s: &str) -> IndexPath {
        IndexPath::parse(s).unwrap()
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(2),
        }
    }

    fn request(route: &str, task_id: &str, rank: i64, expires: DateTime<Utc>) -> IndexRequest {
        let event = TaskEvent {
            task_id: task_id.to_string(),
            run_id: 0,
            status: TaskStatus::Completed,
            routes: vec![format!("index.{route}")],
            expires,
            rank,
            data: json!({ "from": task_id }),
        };
        IndexRequest::from_event(&event, "index")
    }

    fn indexer() -> (Indexer, Stores) {
        let stores = Stores::in_memory();
        (Indexer::new(stores.clone(), fast_retry()), stores)
    }

    #[tokio::test]
    async fn test_creates_ancestor_chain() {
        let (indexer, stores) = indexer();
        let report = indexer
            .index(&request("a.b.c", "T1", 1, t0()))
            .await
            .unwrap();

        assert_eq!(report.paths.len(), 1);
        assert_eq!(report.paths[0].leaf, LeafOutcome::Inserted);
        assert_eq!(report.paths[0].namespaces_written, 2);

        assert!(stores.namespaces.get(&path("a")).unwrap().is_some());
        assert!(stores.namespaces.get(&path("a.b")).unwrap().is_some());
        assert!(stores.namespaces.get(&path("a.b.c")).unwrap().is_none());

        let leaf = stores.tasks.get(&path("a.b.c")).unwrap().unwrap();
        assert_eq!(leaf.task_id, "T1");
        assert!(stores.tasks.get(&path("a.b")).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_single_segment_has_no_namespaces() {
        let (indexer, stores) = indexer();
        let report = indexer.index(&request("solo", "T", 0, t0())).await.unwrap();
        assert_eq!(report.paths[0].namespaces_written, 0);
        assert!(stores.namespaces.scan(None, 10).unwrap().rows.is_empty());
        assert!(stores.tasks.get(&path("solo")).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_idempotent() {
        let (indexer, stores) = indexer();
        let req = request("a.b.c", "T1", 7, t0());

        indexer.index(&req).await.unwrap();
        let once = stores.tasks.get(&path("a.b.c")).unwrap();
        let ns_once = stores.namespaces.scan(None, 10).unwrap();

        let again = indexer.index(&req).await.unwrap();
        assert_eq!(again.paths[0].leaf, LeafOutcome::Replaced);
        assert_eq!(again.paths[0].namespaces_written, 0);
        assert_eq!(stores.tasks.get(&path("a.b.c")).unwrap(), once);
        assert_eq!(stores.namespaces.scan(None, 10).unwrap(), ns_once);
    }

    #[tokio::test]
    async fn test_rank_monotonic_either_order() {
        let low = request("p.q", "LOW", 1, t0());
        let high = request("p.q", "HIGH", 2, t0());

        for order in [[&low, &high], [&high, &low]] {
            let (indexer, stores) = indexer();
            for req in order {
                indexer.index(req).await.unwrap();
            }
            let stored = stores.tasks.get(&path("p.q")).unwrap().unwrap();
            assert_eq!(stored, high.leaf(&path("p.q")));
        }
    }

    #[tokio::test]
    async fn test_equal_rank_last_processed_wins() {
        let (indexer, stores) = indexer();
        indexer.index(&request("p", "FIRST", 5, t0())).await.unwrap();
        indexer.index(&request("p", "SECOND", 5, t0())).await.unwrap();
        assert_eq!(
            stores.tasks.get(&path("p")).unwrap().unwrap().task_id,
            "SECOND"
        );
    }

    #[tokio::test]
    async fn test_lower_rank_is_discarded() {
        let (indexer, stores) = indexer();
        let route = "gecko.v2.mozilla-central.latest.linux64";
        let long = t0() + Duration::days(30);
        let short = t0() + Duration::days(1);

        indexer.index(&request(route, "R100", 100, long)).await.unwrap();
        let report = indexer.index(&request(route, "R50", 50, short)).await.unwrap();

        assert_eq!(
            report.paths[0].leaf,
            LeafOutcome::RankConflict { stored_rank: 100 }
        );
        assert_eq!(report.rank_conflicts(), 1);

        let stored = stores.tasks.get(&path(route)).unwrap().unwrap();
        assert_eq!(stored.rank, 100);
        assert_eq!(stored.task_id, "R100");
        assert_eq!(stored.data, json!({"from": "R100"}));
        assert_eq!(stored.expires, long);
    }

    #[tokio::test]
    async fn test_ancestor_expiry_is_running_max() {
        let (indexer, stores) = indexer();
        let later = t0() + Duration::days(10);

        indexer.index(&request("a.b.c", "T1", 1, later)).await.unwrap();
        indexer.index(&request("a.x", "T2", 1, t0())).await.unwrap();

        // Touched by both events: keeps the later expiry
        let a = stores.namespaces.get(&path("a")).unwrap().unwrap();
        assert_eq!(a.expires, later);

        let even_later = later + Duration::days(1);
        indexer.index(&request("a.x", "T3", 2, even_later)).await.unwrap();
        let a = stores.namespaces.get(&path("a")).unwrap().unwrap();
        assert_eq!(a.expires, even_later);
        let ab = stores.namespaces.get(&path("a.b")).unwrap().unwrap();
        assert_eq!(ab.expires, later);
    }

    #[tokio::test]
    async fn test_multiple_routes() {
        let (indexer, stores) = indexer();
        let event = TaskEvent {
            task_id: "multi".to_string(),
            run_id: 1,
            status: TaskStatus::Completed,
            routes: vec![
                "index.proj.rev.abc".to_string(),
                "index.proj.latest".to_string(),
                "index.bad..route".to_string(),
                "other.route".to_string(),
            ],
            expires: t0(),
            rank: 0,
            data: Value::Null,
        };
        let report = indexer
            .index(&IndexRequest::from_event(&event, "index"))
            .await
            .unwrap();

        assert_eq!(report.paths.len(), 2);
        assert_eq!(report.skipped_routes, 1);
        assert_eq!(report.leaves_written(), 2);
        assert!(stores.tasks.get(&path("proj.rev.abc")).unwrap().is_some());
        assert!(stores.tasks.get(&path("proj.latest")).unwrap().is_some());
        assert!(stores.namespaces.get(&path("proj.rev")).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_ranks_converge() {
        let (indexer, stores) = indexer();
        let indexer = Arc::new(indexer);

        let mut handles = Vec::new();
        for rank in (0..32).rev() {
            let indexer = Arc::clone(&indexer);
            handles.push(tokio::spawn(async move {
                let req = request("race.leaf", &format!("T{rank}"), rank, t0());
                indexer.index(&req).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stored = stores.tasks.get(&path("race.leaf")).unwrap().unwrap();
        assert_eq!(stored.rank, 31);
        assert_eq!(stored.task_id, "T31");
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let stores = Stores {
            namespaces: Arc::new(Flaky::<Namespace>::new(2)),
            tasks: Arc::new(Flaky::<IndexedTask>::new(2)),
        };
        let indexer = Indexer::new(stores.clone(), fast_retry());

        indexer.index(&request("a.b", "T", 1, t0())).await.unwrap();
        assert!(stores.tasks.get(&path("a.b")).unwrap().is_some());
        assert!(stores.namespaces.get(&path("a")).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_event() {
        let stores = Stores {
            namespaces: Arc::new(MemoryTable::<Namespace>::new("namespaces")),
            tasks: Arc::new(Flaky::<IndexedTask>::new(100)),
        };
        let indexer = Indexer::new(stores.clone(), fast_retry());

        let err = indexer
            .index(&request("a.b", "T", 1, t0()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
        assert!(stores.tasks.get(&path("a.b")).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let tasks = Arc::new(Flaky::<IndexedTask>::permanent(1));
        let stores = Stores {
            namespaces: Arc::new(MemoryTable::<Namespace>::new("namespaces")),
            tasks: tasks.clone(),
        };
        let indexer = Indexer::new(stores.clone(), fast_retry());

        let err = indexer
            .index(&request("a.b", "T", 1, t0()))
            .await
            .unwrap_err();
        assert!(!err.is_exhausted());
        assert_eq!(tasks.calls(), 1);
    }
}
