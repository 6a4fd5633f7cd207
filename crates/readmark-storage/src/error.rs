//! Marker storage failures.
//!
//! Only `Regression` is a logic error. The other variants are backend
//! failures that the engine reports and retries.

use thiserror::Error;

/// Why a marker could not be stored or loaded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Marker write would regress the stored position
    ///
    /// Markers only move forward. Writing sequence 3 over a stored sequence 5
    /// for the same key is rejected so a stale writer cannot undo a newer
    /// read position.
    #[error("marker regression: stored sequence {stored}, attempted {attempted}")]
    Regression {
        /// Sequence currently stored
        stored: u64,
        /// Sequence the caller tried to write
        attempted: u64,
    },

    /// A stored marker could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The backend failed: disk, database or injected fault
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}
