//! Observable state snapshots for invariant checking.
//!
//! Snapshots capture the observable state of the engine at a point in time.
//! Invariants operate on snapshots rather than live state to ensure
//! consistent, atomic checks.

use std::collections::{HashMap, HashSet};

use readmark_core::{
    EventId, ReadStateEngine, ReceiptKind, RoomId, RoomReadState, ScopeKey, env::Environment,
};
use readmark_storage::{MarkerStorage, StorageError};

/// One marker slot: a scope and a receipt kind.
pub type MarkerSlot = (ScopeKey, ReceiptKind);

/// Snapshot of one engine and its storage.
#[derive(Debug, Clone, Default)]
pub struct SystemSnapshot {
    /// Derived read state of every tracked room.
    pub rooms: Vec<RoomReadState>,
    /// In-memory marker sequence per slot.
    pub markers: HashMap<MarkerSlot, u64>,
    /// Persisted marker sequence per slot.
    pub persisted: HashMap<MarkerSlot, u64>,
    /// Slots whose latest advance has not reached storage.
    pub unflushed: HashSet<MarkerSlot>,
    /// Effective marker sequence observed after each step, per scope.
    pub marker_history: HashMap<ScopeKey, Vec<u64>>,
    /// Thread roots the index has seen, per room, with whether the root is
    /// indexed.
    pub thread_roots: HashMap<RoomId, Vec<(EventId, bool)>>,
}

impl SystemSnapshot {
    /// Create an empty snapshot.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Capture `engine` for `rooms`, reading persisted markers back from
    /// its storage.
    pub fn capture<E: Environment, S: MarkerStorage>(
        engine: &ReadStateEngine<E, S>,
        rooms: impl IntoIterator<Item = RoomId>,
    ) -> Result<Self, StorageError> {
        let mut snapshot = Self::empty();

        for room_id in rooms {
            let roots = engine
                .timeline()
                .threads(&room_id)
                .into_iter()
                .map(|root| {
                    let known = engine.timeline().root_known(&room_id, &root);
                    (root, known)
                })
                .collect();
            snapshot.thread_roots.insert(room_id.clone(), roots);
            snapshot.rooms.push(engine.room_read_state(&room_id));
        }

        for (scope, marker) in engine.receipts().iter() {
            let slot = (scope.clone(), marker.kind);
            if engine.receipts().is_unflushed(scope, marker.kind) {
                snapshot.unflushed.insert(slot.clone());
            }
            snapshot.markers.insert(slot, marker.sequence);
        }

        for stored in engine.receipts().storage().list_markers()? {
            let scope = ScopeKey {
                room_id: RoomId::new(stored.room_id),
                thread_id: stored.thread_id.map(EventId::new),
            };
            snapshot.persisted.insert((scope, ReceiptKind::from(stored.kind)), stored.sequence);
        }

        Ok(snapshot)
    }

    /// Attach the marker history recorded by the driver.
    #[must_use]
    pub fn with_history(mut self, history: HashMap<ScopeKey, Vec<u64>>) -> Self {
        self.marker_history = history;
        self
    }

    /// Read state of `room_id`, if captured.
    pub fn room(&self, room_id: &RoomId) -> Option<&RoomReadState> {
        self.rooms.iter().find(|r| &r.room_id == room_id)
    }

    /// Effective sequence per scope: the higher of the public and private
    /// markers.
    pub fn effective_markers(&self) -> HashMap<ScopeKey, u64> {
        let mut effective: HashMap<ScopeKey, u64> = HashMap::new();
        for ((scope, _), sequence) in &self.markers {
            let entry = effective.entry(scope.clone()).or_insert(*sequence);
            *entry = (*entry).max(*sequence);
        }
        effective
    }
}
