//! Error types for the indexing pipeline.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while indexing, sweeping or reading the index.
#[derive(Error, Debug)]
pub enum Error {
    /// RocksDB error.
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// A conditional update kept losing to concurrent writers.
    #[error("{table}: conditional update of '{path}' conflicted {attempts} times")]
    Conflict {
        table: String,
        path: String,
        attempts: u32,
    },

    /// The table could not be reached (remote store implementations).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be decoded.
    #[error("{table}: corrupt row at '{key}': {source}")]
    Corrupt {
        table: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// A row could not be encoded for storage.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A transient failure persisted through every retry.
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// A store call on the blocking pool panicked or was cancelled.
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// A listing continuation does not belong to the listed prefix.
    #[error("continuation '{continuation}' is not a child of '{prefix}'")]
    InvalidContinuation { prefix: String, continuation: String },

    /// Path or payload error from the core crate.
    #[error(transparent)]
    Core(#[from] nsindex_core::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::RocksDb(e) => !matches!(
                e.kind(),
                rocksdb::ErrorKind::Corruption
                    | rocksdb::ErrorKind::InvalidArgument
                    | rocksdb::ErrorKind::NotSupported
            ),
            Error::Conflict { .. } | Error::Unavailable(_) | Error::Io(_) => true,
            _ => false,
        }
    }

    /// Whether this is a transient failure that outlasted its retries.
    ///
    /// Only these are worth handing the event out again; every other error
    /// would fail the same way on redelivery.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Error::RetriesExhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_is_transient() {
        let err = Error::Conflict {
            table: "namespaces".to_string(),
            path: "a.b".to_string(),
            attempts: 16,
        };
        assert!(err.is_transient());
        assert!(err.to_string().contains("a.b"));
    }

    #[test]
    fn test_unavailable_is_transient() {
        assert!(Error::Unavailable("throttled".to_string()).is_transient());
    }

    #[test]
    fn test_corrupt_is_permanent() {
        let source = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = Error::Corrupt {
            table: "indexed-tasks".to_string(),
            key: "a.b".to_string(),
            source,
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn test_exhausted_wraps_source() {
        let err = Error::RetriesExhausted {
            operation: "upsert indexed task",
            attempts: 5,
            source: Box::new(Error::Unavailable("timeout".to_string())),
        };
        let msg = err.to_string();
        assert!(msg.contains("upsert indexed task"));
        assert!(msg.contains("5 attempts"));
        assert!(msg.contains("timeout"));
        assert!(!err.is_transient());
        assert!(err.is_exhausted());
        assert!(!Error::Serialization("bad".to_string()).is_exhausted());
    }

    #[test]
    fn test_from_core_error() {
        let core = nsindex_core::IndexPath::parse("a..b").unwrap_err();
        let err: Error = core.into();
        assert!(matches!(err, Error::Core(_)));
        assert!(err.to_string().contains("a..b"));
    }
}
