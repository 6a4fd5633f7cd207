//! Error types for the read-state engine.
//!
//! Only caller mistakes and storage failures at startup surface as errors.
//! Degraded paths during normal operation (a failed marker write, a failed
//! receipt send) are logged and reported as actions instead.

use readmark_storage::StorageError;
use thiserror::Error;

use crate::ids::{EventId, RoomId};

/// Errors returned by [`crate::ReadStateEngine`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The thread has no indexed replies and its root is not indexed
    #[error("unknown thread {thread_id} in room {room_id}")]
    UnknownThread {
        /// Room that was searched
        room_id: RoomId,
        /// Requested thread root
        thread_id: EventId,
    },

    /// Jump target lives in a thread but threads were excluded
    #[error("event {event_id} belongs to thread {thread_id}")]
    EventInThread {
        /// Requested event
        event_id: EventId,
        /// Thread containing the event
        thread_id: EventId,
    },

    /// Marker storage failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_convert() {
        let err: EngineError = StorageError::Io("disk full".to_string()).into();
        assert_eq!(err.to_string(), "storage error: I/O error: disk full");
    }

    #[test]
    fn unknown_thread_names_room_and_root() {
        let err = EngineError::UnknownThread {
            room_id: RoomId::from("!r"),
            thread_id: EventId::from("$t"),
        };
        assert_eq!(err.to_string(), "unknown thread $t in room !r");
    }
}
