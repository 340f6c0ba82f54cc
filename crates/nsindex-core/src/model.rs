//! Index rows and the rules for merging an incoming event into them.
//!
//! Both rules are pure functions of `(existing row, incoming values)` so that
//! a store can apply them inside a single compare-and-swap.

use crate::path::IndexPath;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A row kept in one of the index tables.
pub trait Row: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Table kind, used in logs and metric labels.
    const KIND: &'static str;

    /// The key of this row.
    fn path(&self) -> &IndexPath;

    /// When this row may be deleted.
    fn expires(&self) -> DateTime<Utc>;

    /// Whether the row is past its expiration at `now`.
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires() < now
    }
}

/// One segment-level node of the index hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    pub path: IndexPath,
    pub name: String,
    pub expires: DateTime<Utc>,
}

impl Namespace {
    /// A new namespace row for `path`.
    pub fn new(path: IndexPath, expires: DateTime<Utc>) -> Self {
        let name = path.name().unwrap_or_default().to_string();
        Self {
            path,
            name,
            expires,
        }
    }

    /// Merge an event touching this namespace (or a descendant).
    ///
    /// Returns the row to write, or `None` when the stored row already
    /// outlives `expires`. The stored expiry is the running maximum.
    pub fn touch(
        existing: Option<&Namespace>,
        path: &IndexPath,
        expires: DateTime<Utc>,
    ) -> Option<Namespace> {
        match existing {
            None => Some(Namespace::new(path.clone(), expires)),
            Some(current) if current.expires < expires => Some(Namespace {
                expires,
                ..current.clone()
            }),
            Some(_) => None,
        }
    }
}

impl Row for Namespace {
    const KIND: &'static str = "namespace";

    fn path(&self) -> &IndexPath {
        &self.path
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }
}

/// Leaf row binding a full path to a completed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedTask {
    pub path: IndexPath,
    pub task_id: String,
    pub rank: i64,
    pub data: Value,
    pub expires: DateTime<Utc>,
}

/// How an incoming leaf relates to the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Nothing stored at the path yet.
    Insert,
    /// Incoming rank is greater than or equal to the stored rank.
    Replace,
    /// Stored rank is higher; the incoming leaf is discarded.
    RankConflict,
}

impl Resolution {
    /// Whether the incoming leaf gets written.
    pub fn writes(self) -> bool {
        !matches!(self, Resolution::RankConflict)
    }
}

impl IndexedTask {
    /// Decide what to do with `self` given the row currently stored at its path.
    ///
    /// Equal ranks resolve to the last one processed.
    pub fn resolve(&self, existing: Option<&IndexedTask>) -> Resolution {
        match existing {
            None => Resolution::Insert,
            Some(current) if current.rank <= self.rank => Resolution::Replace,
            Some(_) => Resolution::RankConflict,
        }
    }
}

impl Row for IndexedTask {
    const KIND: &'static str = "indexed_task";

    fn path(&self) -> &IndexPath {
        &self.path
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn leaf(rank: i64, task_id: &str) -> IndexedTask {
        IndexedTask {
            path: IndexPath::parse("a.b.c").unwrap(),
            task_id: task_id.to_string(),
            rank,
            data: json!({ "task": task_id }),
            expires: t0(),
        }
    }

    #[test]
    fn test_namespace_name_is_last_segment() {
        let ns = Namespace::new(IndexPath::parse("a.b").unwrap(), t0());
        assert_eq!(ns.name, "b");
    }

    #[test]
    fn test_touch_inserts_missing() {
        let path = IndexPath::parse("a").unwrap();
        let ns = Namespace::touch(None, &path, t0()).unwrap();
        assert_eq!(ns.expires, t0());
        assert_eq!(ns.path, path);
    }

    #[test]
    fn test_touch_keeps_running_maximum() {
        let path = IndexPath::parse("a").unwrap();
        let stored = Namespace::new(path.clone(), t0() + Duration::days(30));

        assert_eq!(Namespace::touch(Some(&stored), &path, t0()), None);
        assert_eq!(
            Namespace::touch(Some(&stored), &path, t0() + Duration::days(30)),
            None
        );

        let later = t0() + Duration::days(31);
        let updated = Namespace::touch(Some(&stored), &path, later).unwrap();
        assert_eq!(updated.expires, later);
        assert_eq!(updated.name, stored.name);
    }

    #[test]
    fn test_resolve_rank_rule() {
        let stored = leaf(100, "old");
        assert_eq!(leaf(1, "x").resolve(None), Resolution::Insert);
        assert_eq!(leaf(101, "x").resolve(Some(&stored)), Resolution::Replace);
        assert_eq!(leaf(100, "x").resolve(Some(&stored)), Resolution::Replace);
        assert_eq!(leaf(50, "x").resolve(Some(&stored)), Resolution::RankConflict);
        assert!(!Resolution::RankConflict.writes());
    }

    #[test]
    fn test_is_expired_is_strict() {
        let ns = Namespace::new(IndexPath::parse("a").unwrap(), t0());
        assert!(!ns.is_expired(t0()));
        assert!(ns.is_expired(t0() + Duration::seconds(1)));
    }

    #[test]
    fn test_indexed_task_json_shape() {
        let value = serde_json::to_value(leaf(7, "abc")).unwrap();
        assert_eq!(value["taskId"], "abc");
        assert_eq!(value["rank"], 7);
        assert_eq!(value["path"], json!(["a", "b", "c"]));
    }
}
