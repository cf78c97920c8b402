//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID has an invalid prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID is missing the underscore separator.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// A dotted workload ID has the wrong number of segments.
    #[error("expected {expected} dot-separated segments in '{id}', got {actual}")]
    SegmentCount {
        id: String,
        expected: usize,
        actual: usize,
    },

    /// A numeric segment of a workload ID did not parse.
    #[error("invalid {field} in '{id}'")]
    InvalidSegment { id: String, field: &'static str },

    /// A name segment contains a forbidden character.
    #[error("name '{0}' must be non-empty and must not contain '.'")]
    InvalidName(String),
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if this error came from a dotted workload ID.
    pub fn is_workload_error(&self) -> bool {
        matches!(
            self,
            IdError::SegmentCount { .. } | IdError::InvalidSegment { .. } | IdError::InvalidName(_)
        )
    }
}
