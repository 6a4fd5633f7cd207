//! Marker storage held in process memory.

#![allow(clippy::disallowed_types, reason = "Markers guarded by a plain mutex")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use super::{MarkerKey, MarkerStorage, StorageError, StoredMarker};

type MarkerMap = HashMap<MarkerKey, StoredMarker>;

/// Markers kept in a shared map.
///
/// Clones see the same map. The harness restarts a client by dropping the
/// engine and opening a new one over a clone of its storage.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    markers: Arc<Mutex<MarkerMap>>,
}

impl MemoryStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored markers.
    pub fn marker_count(&self) -> usize {
        self.lock().len()
    }

    /// A poisoned lock means a test already panicked mid-write.
    #[allow(clippy::expect_used)]
    fn lock(&self) -> MutexGuard<'_, MarkerMap> {
        self.markers.lock().expect("marker map mutex poisoned")
    }
}

/// Reject `marker` if the map holds a later one under the same key.
fn check_forward(markers: &MarkerMap, marker: &StoredMarker) -> Result<(), StorageError> {
    match markers.get(&marker.key()) {
        Some(stored) if marker.sequence < stored.sequence => {
            Err(StorageError::Regression { stored: stored.sequence, attempted: marker.sequence })
        },
        _ => Ok(()),
    }
}

impl MarkerStorage for MemoryStorage {
    fn store_marker(&self, marker: &StoredMarker) -> Result<(), StorageError> {
        let mut markers = self.lock();
        check_forward(&markers, marker)?;
        markers.insert(marker.key(), marker.clone());
        Ok(())
    }

    fn store_markers(&self, batch: &[StoredMarker]) -> Result<(), StorageError> {
        let mut markers = self.lock();
        for marker in batch {
            check_forward(&markers, marker)?;
        }
        markers.extend(batch.iter().map(|m| (m.key(), m.clone())));
        Ok(())
    }

    fn load_marker(&self, key: &MarkerKey) -> Result<Option<StoredMarker>, StorageError> {
        Ok(self.lock().get(key).cloned())
    }

    fn load_room_markers(&self, room_id: &str) -> Result<Vec<StoredMarker>, StorageError> {
        Ok(self.lock().values().filter(|m| m.room_id == room_id).cloned().collect())
    }

    fn list_markers(&self) -> Result<Vec<StoredMarker>, StorageError> {
        Ok(self.lock().values().cloned().collect())
    }

    fn forget_room(&self, room_id: &str) -> Result<usize, StorageError> {
        let mut markers = self.lock();
        let before = markers.len();
        markers.retain(|key, _| key.room_id != room_id);
        Ok(before - markers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoredReceiptKind;

    fn marker(room: &str, thread: Option<&str>, sequence: u64) -> StoredMarker {
        StoredMarker {
            room_id: room.to_string(),
            thread_id: thread.map(str::to_string),
            kind: StoredReceiptKind::Private,
            event_id: format!("$ev{sequence}"),
            sequence,
            updated_at_ms: 0,
        }
    }

    #[test]
    fn clones_share_markers() {
        let storage = MemoryStorage::new();
        let clone = storage.clone();

        storage.store_marker(&marker("!a", None, 1)).unwrap();

        assert_eq!(clone.marker_count(), 1);
        let loaded = clone.load_marker(&MarkerKey::main("!a", StoredReceiptKind::Private)).unwrap();
        assert_eq!(loaded.unwrap().sequence, 1);
    }

    #[test]
    fn regression_is_rejected() {
        let storage = MemoryStorage::new();
        storage.store_marker(&marker("!a", None, 5)).unwrap();

        let result = storage.store_marker(&marker("!a", None, 3));
        assert_eq!(result, Err(StorageError::Regression { stored: 5, attempted: 3 }));

        // Equal sequence is an idempotent rewrite
        storage.store_marker(&marker("!a", None, 5)).unwrap();
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let storage = MemoryStorage::new();
        storage.store_marker(&marker("!a", Some("$root"), 10)).unwrap();

        let batch = vec![marker("!a", None, 4), marker("!a", Some("$root"), 2)];
        assert!(storage.store_markers(&batch).is_err());

        // Main marker from the failed batch must not have been written
        let main = storage.load_marker(&MarkerKey::main("!a", StoredReceiptKind::Private)).unwrap();
        assert!(main.is_none());
    }

    #[test]
    fn forget_room_only_touches_that_room() {
        let storage = MemoryStorage::new();
        storage.store_marker(&marker("!a", None, 1)).unwrap();
        storage.store_marker(&marker("!a", Some("$t"), 2)).unwrap();
        storage.store_marker(&marker("!b", None, 3)).unwrap();

        assert_eq!(storage.forget_room("!a").unwrap(), 2);
        assert_eq!(storage.marker_count(), 1);
        assert_eq!(storage.load_room_markers("!b").unwrap().len(), 1);
    }
}
