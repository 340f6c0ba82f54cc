//! Task completion event payloads.
//!
//! Payloads arrive as JSON published by the task queue:
//!
//! ```json
//! {
//!   "taskId": "fN1SbArXTPSVFNUvaOlinQ",
//!   "runId": 0,
//!   "status": "completed",
//!   "routes": ["index.gecko.v2.mozilla-central.latest.linux64"],
//!   "expires": "2025-02-01T00:00:00Z",
//!   "rank": 1700000000,
//!   "data": {"artifact": "public/build/target.tar.bz2"}
//! }
//! ```
//!
//! [`parse_event`] validates the payload and [`IndexRequest::from_event`]
//! turns it into the split paths the indexer works on.

use crate::model::IndexedTask;
use crate::path::IndexPath;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Run state reported by the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Exception,
}

/// A task completion event as published on the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub task_id: String,
    pub run_id: u32,
    pub status: TaskStatus,
    pub routes: Vec<String>,
    pub expires: DateTime<Utc>,
    #[serde(default)]
    pub rank: i64,
    #[serde(default = "empty_object")]
    pub data: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// Parse and validate a raw payload.
///
/// Any error returned here means the payload can never be indexed, no matter
/// how often it is redelivered.
pub fn parse_event(payload: &[u8]) -> Result<TaskEvent> {
    let event: TaskEvent = serde_json::from_slice(payload)?;

    if event.task_id.trim().is_empty() {
        return Err(Error::InvalidField {
            field: "taskId",
            reason: "must not be empty".to_string(),
        });
    }

    Ok(event)
}

/// A route that was declared but will not be indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRoute {
    pub route: String,
    pub reason: String,
}

/// Everything the indexer needs from one event, with routes already split.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRequest {
    pub task_id: String,
    pub paths: Vec<IndexPath>,
    pub expires: DateTime<Utc>,
    pub rank: i64,
    pub data: Value,
    /// Routes under the prefix whose remainder is not a valid path.
    pub skipped: Vec<SkippedRoute>,
}

impl IndexRequest {
    /// Extract index paths from the routes of `event`.
    ///
    /// Routes outside `<prefix>.` are silently ignored; those inside it that
    /// do not form a valid path are reported in `skipped`. Duplicate routes
    /// collapse to one path.
    pub fn from_event(event: &TaskEvent, prefix: &str) -> Self {
        let mut paths: Vec<IndexPath> = Vec::with_capacity(event.routes.len());
        let mut skipped = Vec::new();

        for route in &event.routes {
            match IndexPath::from_route(route, prefix) {
                Ok(path) => {
                    if !paths.contains(&path) {
                        paths.push(path);
                    }
                }
                Err(Error::ForeignRoute { .. }) => {}
                Err(e) => skipped.push(SkippedRoute {
                    route: route.clone(),
                    reason: e.to_string(),
                }),
            }
        }

        Self {
            task_id: event.task_id.clone(),
            paths,
            expires: event.expires,
            rank: event.rank,
            data: event.data.clone(),
            skipped,
        }
    }

    /// The leaf row this request writes at `path`.
    pub fn leaf(&self, path: &IndexPath) -> IndexedTask {
        IndexedTask {
            path: path.clone(),
            task_id: self.task_id.clone(),
            rank: self.rank,
            data: self.data.clone(),
            expires: self.expires,
        }
    }
}
