//! Storage abstraction for read markers
//!
//! Trait-based abstraction for persisting the local user's read markers. The
//! trait is synchronous (no async): the read-state engine flushes a marker
//! inside the same call that advances it, so a restart immediately afterwards
//! observes the new position.
//!
//! Markers are keyed by `(room, thread | none, kind)`. Values are plain
//! strings and integers so this crate does not depend on the engine's types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod chaotic;
mod error;
mod memory;
mod redb;

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
pub use memory::MemoryStorage;
use serde::{Deserialize, Serialize};

pub use self::redb::RedbStorage;

/// Which receipt a stored marker belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StoredReceiptKind {
    /// Receipt synced to the server and visible to other members.
    Public,
    /// Local-only receipt.
    Private,
}

impl StoredReceiptKind {
    /// Single-byte tag used in storage keys.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Public => 0,
            Self::Private => 1,
        }
    }
}

/// Identity of a stored marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MarkerKey {
    /// Room the marker belongs to.
    pub room_id: String,
    /// Thread root for thread markers, `None` for the main timeline.
    pub thread_id: Option<String>,
    /// Receipt kind.
    pub kind: StoredReceiptKind,
}

impl MarkerKey {
    /// Key for a main-timeline marker.
    pub fn main(room_id: impl Into<String>, kind: StoredReceiptKind) -> Self {
        Self { room_id: room_id.into(), thread_id: None, kind }
    }

    /// Key for a thread marker.
    pub fn thread(
        room_id: impl Into<String>,
        thread_id: impl Into<String>,
        kind: StoredReceiptKind,
    ) -> Self {
        Self { room_id: room_id.into(), thread_id: Some(thread_id.into()), kind }
    }
}

/// A persisted read marker.
///
/// `sequence` is the server-assigned ordering of `event_id` within its room.
/// It is stored alongside the event so positions can be compared after a
/// restart, before the event itself is loaded again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMarker {
    /// Room the marker belongs to.
    pub room_id: String,
    /// Thread root, `None` for the main timeline.
    pub thread_id: Option<String>,
    /// Receipt kind.
    pub kind: StoredReceiptKind,
    /// Event the marker points at.
    pub event_id: String,
    /// Ordering of `event_id` in its room.
    pub sequence: u64,
    /// Wall-clock milliseconds of the last update.
    pub updated_at_ms: u64,
}

impl StoredMarker {
    /// Storage key of this marker.
    pub fn key(&self) -> MarkerKey {
        MarkerKey { room_id: self.room_id.clone(), thread_id: self.thread_id.clone(), kind: self.kind }
    }
}

/// Storage abstraction for read markers
///
/// Must be Clone (the engine and the caller may both hold it), Send + Sync
/// (thread-safe), and synchronous (no async methods). Implementations
/// typically share internal state via Arc, so clones access the same
/// underlying storage.
///
/// # Panics
///
/// Implementations may panic if internal synchronization primitives are
/// poisoned (a thread panicked while holding a lock). Acceptable for
/// test/simulation code, but production implementations should handle poisoned
/// mutexes gracefully.
pub trait MarkerStorage: Clone + Send + Sync + 'static {
    /// Store a marker, replacing the previous marker with the same key.
    ///
    /// # Invariants
    ///
    /// - Pre: `marker.sequence` is not lower than the stored sequence for the
    ///   same key, otherwise [`StorageError::Regression`] is returned
    /// - Post: an equal sequence is accepted and overwrites `updated_at_ms`
    fn store_marker(&self, marker: &StoredMarker) -> Result<(), StorageError>;

    /// Store several markers atomically.
    ///
    /// Either every marker is written or none is. The default implementation
    /// writes one by one and is only atomic for backends whose
    /// `store_marker` cannot fail halfway.
    fn store_markers(&self, markers: &[StoredMarker]) -> Result<(), StorageError> {
        for marker in markers {
            self.store_marker(marker)?;
        }
        Ok(())
    }

    /// Load a single marker.
    ///
    /// Returns `None` if nothing is stored for `key`.
    fn load_marker(&self, key: &MarkerKey) -> Result<Option<StoredMarker>, StorageError>;

    /// All markers of a room (main timeline and threads, both kinds).
    ///
    /// Order is not guaranteed.
    fn load_room_markers(&self, room_id: &str) -> Result<Vec<StoredMarker>, StorageError>;

    /// Every stored marker.
    ///
    /// Used on startup to restore the receipt store. Entries that cannot be
    /// decoded are skipped (and logged) so one corrupt marker never hides
    /// the others. Order is not guaranteed.
    fn list_markers(&self) -> Result<Vec<StoredMarker>, StorageError>;

    /// Remove every marker of a room. Returns how many were removed.
    fn forget_room(&self, room_id: &str) -> Result<usize, StorageError>;
}
