//! Hierarchical index paths.
//!
//! An [`IndexPath`] is the ordered list of segments addressed by a route such
//! as `index.project.branch.latest.artifact`. Routes are split exactly once,
//! when an event is taken in; everything downstream works on segments.
//!
//! # Storage Keys
//!
//! Rows are keyed by `[dotted parent][0x00][name]`:
//!
//! ```text
//! a        ->  \0a
//! a.b      ->  a\0b
//! a.b.c    ->  a.b\0c
//! ```
//!
//! All direct children of a path therefore share the byte prefix
//! `[dotted path][0x00]` and sort by name, which makes child listings a
//! single ordered range scan.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator between segments in dotted paths and routes.
pub const SEPARATOR: char = '.';

/// Byte separating the parent path from the last segment in storage keys.
const KEY_SEPARATOR: u8 = 0x00;

/// An ordered sequence of non-empty path segments.
///
/// The empty path is the root of the hierarchy. It is never stored as a row,
/// but it is a valid prefix for listing top-level namespaces.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct IndexPath {
    segments: Vec<String>,
}

impl IndexPath {
    /// The root path (no segments).
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a dotted path. The empty string is the root.
    pub fn parse(dotted: &str) -> Result<Self> {
        if dotted.is_empty() {
            return Ok(Self::root());
        }
        Self::from_segments(dotted.split(SEPARATOR))
    }

    /// Build a path from already-split segments.
    pub fn from_segments<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        for segment in &segments {
            validate_segment(segment).map_err(|reason| Error::InvalidPath {
                path: segments.join("."),
                reason,
            })?;
        }
        Ok(Self { segments })
    }

    /// Parse the path addressed by a route such as `index.a.b.c`.
    ///
    /// Fails with [`Error::ForeignRoute`] when the route does not start with
    /// `<prefix>.`, and with [`Error::InvalidPath`] when the remainder is
    /// empty or contains an invalid segment.
    pub fn from_route(route: &str, prefix: &str) -> Result<Self> {
        let remainder = route
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix(SEPARATOR))
            .ok_or_else(|| Error::ForeignRoute {
                route: route.to_string(),
                prefix: prefix.to_string(),
            })?;

        let path = Self::parse(remainder)?;
        if path.is_root() {
            return Err(Error::InvalidPath {
                path: route.to_string(),
                reason: "route addresses no namespace",
            });
        }
        Ok(path)
    }

    /// The segments of this path.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Whether this is the root path.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// The last segment, or `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// The parent path, or `None` for the root.
    pub fn parent(&self) -> Option<IndexPath> {
        let (_, parent) = self.segments.split_last()?;
        Some(Self {
            segments: parent.to_vec(),
        })
    }

    /// Proper, non-root prefixes of this path, shortest first.
    ///
    /// For `a.b.c` this yields `a` then `a.b`.
    pub fn ancestors(&self) -> impl Iterator<Item = IndexPath> + '_ {
        (1..self.segments.len()).map(|n| Self {
            segments: self.segments[..n].to_vec(),
        })
    }

    /// Append one segment.
    pub fn child(&self, name: &str) -> Result<IndexPath> {
        validate_segment(name).map_err(|reason| Error::InvalidPath {
            path: format!("{self}.{name}"),
            reason,
        })?;
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Ok(Self { segments })
    }

    /// Whether `self` is the parent of `other`.
    pub fn is_parent_of(&self, other: &IndexPath) -> bool {
        other.segments.len() == self.segments.len() + 1
            && other.segments.starts_with(&self.segments)
    }

    /// The row key for this path. The root has an empty key.
    pub fn storage_key(&self) -> Vec<u8> {
        match self.segments.split_last() {
            Some((name, parent)) => {
                let mut key = parent.join(".").into_bytes();
                key.push(KEY_SEPARATOR);
                key.extend_from_slice(name.as_bytes());
                key
            }
            None => Vec::new(),
        }
    }

    /// The key prefix shared by all direct children of this path.
    pub fn children_prefix(&self) -> Vec<u8> {
        let mut prefix = self.segments.join(".").into_bytes();
        prefix.push(KEY_SEPARATOR);
        prefix
    }
}

fn validate_segment(segment: &str) -> std::result::Result<(), &'static str> {
    if segment.is_empty() {
        return Err("empty segment");
    }
    if segment.contains(SEPARATOR) {
        return Err("segment contains '.'");
    }
    if segment.as_bytes().contains(&KEY_SEPARATOR) {
        return Err("segment contains NUL byte");
    }
    Ok(())
}

impl fmt::Display for IndexPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

impl FromStr for IndexPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<Vec<String>> for IndexPath {
    type Error = Error;

    fn try_from(segments: Vec<String>) -> Result<Self> {
        Self::from_segments(segments)
    }
}

impl From<IndexPath> for Vec<String> {
    fn from(path: IndexPath) -> Self {
        path.segments
    }
}
