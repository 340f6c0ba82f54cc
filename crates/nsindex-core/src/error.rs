//! Error types for index paths and completion event payloads.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while parsing paths or event payloads.
#[derive(Error, Debug)]
pub enum Error {
    /// A dotted path or segment list is not a valid index path.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath {
        /// The offending path, as received.
        path: String,
        /// Description of what's wrong.
        reason: &'static str,
    },

    /// A route does not address the index (missing or wrong prefix).
    #[error("route '{route}' does not start with '{prefix}.'")]
    ForeignRoute {
        /// The declared route.
        route: String,
        /// The configured route prefix.
        prefix: String,
    },

    /// A payload field has a value the schema does not allow.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// JSON parsing error (unparseable body, missing or mistyped field).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
