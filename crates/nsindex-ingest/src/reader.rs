//! Read-only lookups against the index tables.

use crate::Result;
use crate::store::{IndexedTaskStore, NamespaceStore, Page, Stores};
use nsindex_core::{IndexPath, IndexedTask, Namespace};

/// Largest page a single listing returns.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Path and prefix queries over the namespace and indexed task tables.
#[derive(Clone)]
pub struct IndexReader {
    namespaces: NamespaceStore,
    tasks: IndexedTaskStore,
}

impl IndexReader {
    pub fn new(stores: Stores) -> Self {
        Self {
            namespaces: stores.namespaces,
            tasks: stores.tasks,
        }
    }

    pub fn get_namespace(&self, path: &IndexPath) -> Result<Option<Namespace>> {
        self.namespaces.get(path)
    }

    pub fn get_indexed_task(&self, path: &IndexPath) -> Result<Option<IndexedTask>> {
        self.tasks.get(path)
    }

    /// Look up the task indexed under a dotted path such as `a.b.c`.
    pub fn find_task(&self, dotted: &str) -> Result<Option<IndexedTask>> {
        let path = IndexPath::parse(dotted)?;
        if path.is_root() {
            return Ok(None);
        }
        self.tasks.get(&path)
    }

    /// Namespaces directly below `prefix`, ordered by name.
    ///
    /// `limit` is clamped to `1..=MAX_PAGE_SIZE`.
    pub fn list_child_namespaces(
        &self,
        prefix: &IndexPath,
        continuation: Option<&IndexPath>,
        limit: usize,
    ) -> Result<Page<Namespace>> {
        self.namespaces
            .list(prefix, continuation, clamp_limit(limit))
    }

    /// Indexed tasks directly below `prefix`, ordered by name.
    ///
    /// `limit` is clamped to `1..=MAX_PAGE_SIZE`.
    pub fn list_child_tasks(
        &self,
        prefix: &IndexPath,
        continuation: Option<&IndexPath>,
        limit: usize,
    ) -> Result<Page<IndexedTask>> {
        self.tasks.list(prefix, continuation, clamp_limit(limit))
    }
}

fn clamp_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::Indexer;
    use crate::retry::RetryPolicy;
    use chrono::{TimeZone, Utc};
    use nsindex_core::IndexRequest;
    use serde_json::json;

    async fn seeded() -> IndexReader {
        let stores = Stores::in_memory();
        let indexer = Indexer::new(stores.clone(), RetryPolicy::default());
        for (route, task_id) in [
            ("gecko.v2.central.latest.linux64", "T1"),
            ("gecko.v2.central.latest.win64", "T2"),
            ("gecko.v2.central.pushdate.2030", "T3"),
            ("gecko.v2.beta.latest.linux64", "T4"),
        ] {
            let request = IndexRequest {
                task_id: task_id.to_string(),
                paths: vec![IndexPath::parse(route).unwrap()],
                expires: Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap(),
                rank: 0,
                data: json!({"task": task_id}),
                skipped: Vec::new(),
            };
            indexer.index(&request).await.unwrap();
        }
        IndexReader::new(stores)
    }

    #[tokio::test]
    async fn test_find_task() {
        let reader = seeded().await;
        let task = reader
            .find_task("gecko.v2.central.latest.win64")
            .unwrap()
            .unwrap();
        assert_eq!(task.task_id, "T2");
        assert!(reader.find_task("gecko.v2.central").unwrap().is_none());
        assert!(reader.find_task("").unwrap().is_none());
        assert!(reader.find_task("a..b").is_err());
    }

    #[tokio::test]
    async fn test_get_namespace() {
        let reader = seeded().await;
        let ns = reader
            .get_namespace(&IndexPath::parse("gecko.v2.central").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(ns.name, "central");
        assert!(
            reader
                .get_indexed_task(&IndexPath::parse("gecko.v2.central").unwrap())
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_list_children() {
        let reader = seeded().await;
        let root = reader
            .list_child_namespaces(&IndexPath::root(), None, 10)
            .unwrap();
        assert_eq!(root.rows.len(), 1);
        assert_eq!(root.rows[0].name, "gecko");

        let branches = reader
            .list_child_namespaces(&IndexPath::parse("gecko.v2").unwrap(), None, 10)
            .unwrap();
        let names: Vec<&str> = branches.rows.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["beta", "central"]);

        let latest = IndexPath::parse("gecko.v2.central.latest").unwrap();
        let first = reader.list_child_tasks(&latest, None, 1).unwrap();
        assert_eq!(first.rows[0].task_id, "T1");
        let rest = reader
            .list_child_tasks(&latest, first.continuation.as_ref(), 1)
            .unwrap();
        assert_eq!(rest.rows[0].task_id, "T2");
        assert!(rest.continuation.is_none());
    }

    #[tokio::test]
    async fn test_zero_limit_is_clamped() {
        let reader = seeded().await;
        let page = reader
            .list_child_namespaces(&IndexPath::parse("gecko").unwrap(), None, 0)
            .unwrap();
        assert_eq!(page.rows.len(), 1);
    }
}
