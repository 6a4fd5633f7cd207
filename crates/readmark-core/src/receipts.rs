//! Receipt store.
//!
//! Holds the local user's public and private read markers for every scope
//! and writes each advance through to [`MarkerStorage`] before returning.
//!
//! # Invariants
//!
//! - Markers are monotonic per `(scope, kind)`: an update is applied only if
//!   its sequence is strictly greater than the current one. Markers compare
//!   by sequence alone, so a marker reads every event sharing its sequence,
//!   whichever of them arrived first.
//! - The effective marker of a scope is whichever of public and private has
//!   the higher sequence.
//! - A failed write leaves the in-memory marker advanced. The scope is
//!   remembered as unflushed until [`ReceiptStore::flush`] succeeds.

use std::collections::{BTreeSet, HashMap};

use readmark_storage::{MarkerStorage, StorageError, StoredMarker, StoredReceiptKind};
use serde::{Deserialize, Serialize};

use crate::ids::{EventId, RoomId, ScopeKey};

/// Receipt visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReceiptKind {
    /// Synced to the server and visible to other members.
    Public,
    /// Local-only.
    Private,
}

/// Which scopes a receipt reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReceiptThreading {
    /// Reads the scope of the acknowledged event only.
    Threaded,
    /// Reads every scope of the room up to the acknowledged event's sequence.
    Unthreaded,
}

impl From<ReceiptKind> for StoredReceiptKind {
    fn from(kind: ReceiptKind) -> Self {
        match kind {
            ReceiptKind::Public => Self::Public,
            ReceiptKind::Private => Self::Private,
        }
    }
}

impl From<StoredReceiptKind> for ReceiptKind {
    fn from(kind: StoredReceiptKind) -> Self {
        match kind {
            StoredReceiptKind::Public => Self::Public,
            StoredReceiptKind::Private => Self::Private,
        }
    }
}

/// A read marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadMarker {
    /// Last read event.
    pub event_id: EventId,
    /// Sequence of `event_id` in its room.
    pub sequence: u64,
    /// Receipt kind.
    pub kind: ReceiptKind,
    /// Wall-clock milliseconds of the last advance.
    pub updated_at_ms: u64,
}

/// Outcome of a marker update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// The update did not move the marker forward and was dropped.
    Ignored,
    /// Marker advanced and persisted.
    Applied,
    /// Marker advanced in memory but the write failed.
    ///
    /// The scope stays queued for [`ReceiptStore::flush`].
    NotPersisted(StorageError),
}

impl Advance {
    /// Whether the in-memory marker moved.
    pub fn is_advanced(&self) -> bool {
        !matches!(self, Self::Ignored)
    }
}

/// Outcome of [`ReceiptStore::advance_markers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchAdvance {
    /// Markers that moved, as `(scope, event, sequence)`.
    pub advanced: Vec<(ScopeKey, EventId, u64)>,
    /// `Ignored` when nothing moved, otherwise how the write went.
    pub outcome: Advance,
}

type MarkerSlot = (ScopeKey, ReceiptKind);

/// Public and private markers for every scope.
pub struct ReceiptStore<S: MarkerStorage> {
    storage: S,
    markers: HashMap<MarkerSlot, ReadMarker>,
    unflushed: BTreeSet<MarkerSlot>,
}

impl<S: MarkerStorage> ReceiptStore<S> {
    /// Open a store and load every persisted marker.
    ///
    /// Entries the backend cannot decode are skipped by the backend; their
    /// scopes read as never read.
    pub fn open(storage: S) -> Result<Self, StorageError> {
        let stored = storage.list_markers()?;

        let mut markers = HashMap::with_capacity(stored.len());
        for marker in stored {
            let scope = ScopeKey {
                room_id: RoomId::new(marker.room_id),
                thread_id: marker.thread_id.map(EventId::new),
            };
            let kind = ReceiptKind::from(marker.kind);
            markers.insert(
                (scope, kind),
                ReadMarker {
                    event_id: EventId::new(marker.event_id),
                    sequence: marker.sequence,
                    kind,
                    updated_at_ms: marker.updated_at_ms,
                },
            );
        }

        tracing::info!(markers = markers.len(), "Restored read markers");

        Ok(Self { storage, markers, unflushed: BTreeSet::new() })
    }

    /// Effective marker of `scope`: the more advanced of public and private.
    pub fn get_marker(&self, scope: &ScopeKey) -> Option<&ReadMarker> {
        let public = self.marker(scope, ReceiptKind::Public);
        let private = self.marker(scope, ReceiptKind::Private);

        match (public, private) {
            (Some(public), Some(private)) => {
                if private.sequence > public.sequence { Some(private) } else { Some(public) }
            },
            (public, private) => public.or(private),
        }
    }

    /// Marker of one kind.
    pub fn marker(&self, scope: &ScopeKey, kind: ReceiptKind) -> Option<&ReadMarker> {
        self.markers.get(&(scope.clone(), kind))
    }

    /// Advance a marker because of a local action.
    pub fn set_marker(
        &mut self,
        scope: &ScopeKey,
        event_id: &EventId,
        sequence: u64,
        kind: ReceiptKind,
        now_ms: u64,
    ) -> Advance {
        let advance = self.advance(scope, event_id, sequence, kind, now_ms);
        if advance.is_advanced() {
            tracing::debug!(scope = %scope, event_id = %event_id, sequence, ?kind, "Marker advanced");
        }
        advance
    }

    /// Advance a marker because the receipt transport reported a newer one.
    ///
    /// Stale and duplicate reports are ignored.
    pub fn on_remote_marker_advance(
        &mut self,
        scope: &ScopeKey,
        event_id: &EventId,
        sequence: u64,
        kind: ReceiptKind,
        now_ms: u64,
    ) -> Advance {
        let advance = self.advance(scope, event_id, sequence, kind, now_ms);
        match advance {
            Advance::Ignored => {
                tracing::debug!(scope = %scope, event_id = %event_id, ?kind, "Stale remote receipt");
            },
            Advance::Applied | Advance::NotPersisted(_) => {
                tracing::debug!(
                    scope = %scope,
                    event_id = %event_id,
                    sequence,
                    ?kind,
                    "Remote marker advanced"
                );
            },
        }
        advance
    }

    /// Advance several markers of one kind with a single atomic write.
    ///
    /// Updates that would not move their marker are dropped. If the write
    /// fails, every advanced marker stays advanced in memory and is queued
    /// for [`ReceiptStore::flush`].
    pub fn advance_markers(
        &mut self,
        updates: Vec<(ScopeKey, EventId, u64)>,
        kind: ReceiptKind,
        now_ms: u64,
    ) -> BatchAdvance {
        let mut advanced = Vec::new();
        let mut stored = Vec::new();

        for (scope, event_id, sequence) in updates {
            let slot = (scope.clone(), kind);
            if self.markers.get(&slot).is_some_and(|current| sequence <= current.sequence) {
                continue;
            }

            let marker = ReadMarker { event_id, sequence, kind, updated_at_ms: now_ms };
            stored.push(to_stored(&scope, &marker));
            advanced.push((scope, marker.event_id.clone(), sequence));
            self.markers.insert(slot, marker);
        }

        if stored.is_empty() {
            return BatchAdvance { advanced, outcome: Advance::Ignored };
        }

        let outcome = match self.storage.store_markers(&stored) {
            Ok(()) => {
                for (scope, ..) in &advanced {
                    self.unflushed.remove(&(scope.clone(), kind));
                }
                Advance::Applied
            },
            Err(e) => {
                tracing::warn!(
                    markers = advanced.len(),
                    ?kind,
                    error = %e,
                    "Failed to persist read markers"
                );
                for (scope, ..) in &advanced {
                    self.unflushed.insert((scope.clone(), kind));
                }
                Advance::NotPersisted(e)
            },
        };

        tracing::debug!(markers = advanced.len(), ?kind, "Markers advanced together");
        BatchAdvance { advanced, outcome }
    }

    /// Retry writing every unflushed marker.
    ///
    /// Returns how many markers were written. Markers the backend already
    /// holds at a newer position count as flushed. On failure the remaining
    /// markers stay queued and the first error is returned.
    pub fn flush(&mut self) -> Result<usize, StorageError> {
        let mut flushed = 0;
        let mut first_error = None;

        for slot in std::mem::take(&mut self.unflushed) {
            let Some(stored) = self.markers.get(&slot).map(|m| to_stored(&slot.0, m)) else {
                continue;
            };

            match self.storage.store_marker(&stored) {
                Ok(()) => flushed += 1,
                Err(StorageError::Regression { stored, attempted }) => {
                    tracing::debug!(
                        scope = %slot.0,
                        stored,
                        attempted,
                        "Backend already holds a newer marker"
                    );
                    flushed += 1;
                },
                Err(e) => {
                    self.unflushed.insert(slot);
                    first_error.get_or_insert(e);
                },
            }
        }

        match first_error {
            Some(e) => {
                tracing::warn!(
                    error = %e,
                    remaining = self.unflushed.len(),
                    "Marker flush incomplete"
                );
                Err(e)
            },
            None => Ok(flushed),
        }
    }

    /// Number of markers waiting for a successful write.
    pub fn unflushed_count(&self) -> usize {
        self.unflushed.len()
    }

    /// Whether a marker is waiting for a successful write.
    pub fn is_unflushed(&self, scope: &ScopeKey, kind: ReceiptKind) -> bool {
        self.unflushed.contains(&(scope.clone(), kind))
    }

    /// Every marker with its scope.
    pub fn iter(&self) -> impl Iterator<Item = (&ScopeKey, &ReadMarker)> {
        self.markers.iter().map(|((scope, _), marker)| (scope, marker))
    }

    /// Drop every marker of `room_id`, in memory and in storage.
    pub fn forget_room(&mut self, room_id: &RoomId) -> Result<usize, StorageError> {
        self.markers.retain(|(scope, _), _| &scope.room_id != room_id);
        self.unflushed.retain(|(scope, _)| &scope.room_id != room_id);
        self.storage.forget_room(room_id.as_str())
    }

    /// Backing storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn advance(
        &mut self,
        scope: &ScopeKey,
        event_id: &EventId,
        sequence: u64,
        kind: ReceiptKind,
        now_ms: u64,
    ) -> Advance {
        let slot = (scope.clone(), kind);

        if self.markers.get(&slot).is_some_and(|current| sequence <= current.sequence) {
            return Advance::Ignored;
        }

        let marker = ReadMarker { event_id: event_id.clone(), sequence, kind, updated_at_ms: now_ms };
        let stored = to_stored(scope, &marker);
        self.markers.insert(slot.clone(), marker);

        match self.storage.store_marker(&stored) {
            Ok(()) => {
                self.unflushed.remove(&slot);
                Advance::Applied
            },
            Err(e) => {
                tracing::warn!(scope = %scope, ?kind, error = %e, "Failed to persist read marker");
                self.unflushed.insert(slot);
                Advance::NotPersisted(e)
            },
        }
    }
}

fn to_stored(scope: &ScopeKey, marker: &ReadMarker) -> StoredMarker {
    StoredMarker {
        room_id: scope.room_id.as_str().to_string(),
        thread_id: scope.thread_id.as_ref().map(|t| t.as_str().to_string()),
        kind: marker.kind.into(),
        event_id: marker.event_id.as_str().to_string(),
        sequence: marker.sequence,
        updated_at_ms: marker.updated_at_ms,
    }
}
