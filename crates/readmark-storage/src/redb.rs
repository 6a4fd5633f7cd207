//! Markers persisted in a redb file.
//!
//! Every write runs in its own redb transaction, so a batch of markers lands
//! whole or not at all and a crash never leaves a half-written marker.

use std::{path::Path, sync::Arc};

use redb::{Database, ReadableTable, TableDefinition};

use super::{MarkerKey, MarkerStorage, StorageError, StoredMarker};

/// Table: markers
/// Key: [room_len: u32 BE][room bytes][kind: u8][has_thread: u8][thread bytes]
/// Value: CBOR-encoded StoredMarker
const MARKERS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("markers");

/// Marker storage in a single redb database file.
///
/// Clones share the open database.
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open the database at `path`, creating the file and the marker table
    /// on first use.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(db_err)?;

        let txn = db.begin_write().map_err(db_err)?;
        {
            let _ = txn.open_table(MARKERS).map_err(db_err)?;
        }
        txn.commit().map_err(db_err)?;

        tracing::info!(path = %path.as_ref().display(), "Opened marker database");

        Ok(Self { db: Arc::new(db) })
    }

    /// Write `markers` inside one write transaction.
    ///
    /// Nothing is committed if any marker would regress.
    fn write_batch(&self, markers: &[StoredMarker]) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(db_err)?;

        {
            let mut table = txn.open_table(MARKERS).map_err(db_err)?;

            for marker in markers {
                let key = encode_marker_key(&marker.key());

                let stored = table
                    .get(key.as_slice())
                    .map_err(db_err)?
                    .map(|value| decode_marker(value.value()));

                match stored {
                    Some(Ok(stored)) if marker.sequence < stored.sequence => {
                        return Err(StorageError::Regression {
                            stored: stored.sequence,
                            attempted: marker.sequence,
                        });
                    },
                    Some(Err(e)) => {
                        tracing::warn!(
                            room_id = %marker.room_id,
                            error = %e,
                            "Overwriting undecodable marker"
                        );
                    },
                    _ => {},
                }

                let bytes = encode_marker(marker)?;
                table
                    .insert(key.as_slice(), bytes.as_slice())
                    .map_err(db_err)?;
            }
        }

        txn.commit().map_err(db_err)?;

        Ok(())
    }
}

impl MarkerStorage for RedbStorage {
    fn store_marker(&self, marker: &StoredMarker) -> Result<(), StorageError> {
        self.write_batch(std::slice::from_ref(marker))
    }

    fn store_markers(&self, markers: &[StoredMarker]) -> Result<(), StorageError> {
        self.write_batch(markers)
    }

    fn load_marker(&self, key: &MarkerKey) -> Result<Option<StoredMarker>, StorageError> {
        let txn = self.db.begin_read().map_err(db_err)?;

        let table = txn.open_table(MARKERS).map_err(db_err)?;

        let key = encode_marker_key(key);

        match table.get(key.as_slice()).map_err(db_err)? {
            Some(value) => Ok(Some(decode_marker(value.value())?)),
            None => Ok(None),
        }
    }

    fn load_room_markers(&self, room_id: &str) -> Result<Vec<StoredMarker>, StorageError> {
        let txn = self.db.begin_read().map_err(db_err)?;

        let table = txn.open_table(MARKERS).map_err(db_err)?;

        let prefix = encode_room_prefix(room_id);

        let results =
            table.range(prefix.as_slice()..).map_err(db_err)?;

        let mut markers = Vec::new();
        for result in results {
            let (key, value) = result.map_err(db_err)?;

            if !key.value().starts_with(&prefix) {
                break;
            }

            match decode_marker(value.value()) {
                Ok(marker) => markers.push(marker),
                Err(e) => {
                    tracing::warn!(room_id = %room_id, error = %e, "Skipping undecodable marker");
                },
            }
        }

        Ok(markers)
    }

    fn list_markers(&self) -> Result<Vec<StoredMarker>, StorageError> {
        let txn = self.db.begin_read().map_err(db_err)?;

        let table = txn.open_table(MARKERS).map_err(db_err)?;

        let mut markers = Vec::new();

        for result in table.iter().map_err(db_err)? {
            let (_, value) = result.map_err(db_err)?;

            match decode_marker(value.value()) {
                Ok(marker) => markers.push(marker),
                Err(e) => tracing::warn!(error = %e, "Skipping undecodable marker"),
            }
        }

        Ok(markers)
    }

    fn forget_room(&self, room_id: &str) -> Result<usize, StorageError> {
        let txn = self.db.begin_write().map_err(db_err)?;

        let prefix = encode_room_prefix(room_id);
        let removed;

        {
            let mut table = txn.open_table(MARKERS).map_err(db_err)?;

            let mut keys = Vec::new();
            for result in
                table.range(prefix.as_slice()..).map_err(db_err)?
            {
                let (key, _) = result.map_err(db_err)?;
                if !key.value().starts_with(&prefix) {
                    break;
                }
                keys.push(key.value().to_vec());
            }

            for key in &keys {
                table.remove(key.as_slice()).map_err(db_err)?;
            }
            removed = keys.len();
        }

        txn.commit().map_err(db_err)?;

        Ok(removed)
    }
}

/// Encode the room part of a marker key.
///
/// Layout: [room_len: u32 BE][room bytes]. The length prefix keeps room
/// `!ab` from matching the prefix of room `!abc`.
fn encode_room_prefix(room_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + room_id.len());
    key.extend_from_slice(&(room_id.len() as u32).to_be_bytes());
    key.extend_from_slice(room_id.as_bytes());
    key
}

/// Encode a full marker key.
///
/// Layout: [room prefix][kind: u8][has_thread: u8][thread bytes]
fn encode_marker_key(key: &MarkerKey) -> Vec<u8> {
    let mut bytes = encode_room_prefix(&key.room_id);
    bytes.push(key.kind.as_byte());
    match &key.thread_id {
        Some(thread_id) => {
            bytes.push(1);
            bytes.extend_from_slice(thread_id.as_bytes());
        },
        None => bytes.push(0),
    }
    bytes
}

fn encode_marker(marker: &StoredMarker) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(marker, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

fn db_err(err: impl std::fmt::Display) -> StorageError {
    StorageError::Io(err.to_string())
}

fn decode_marker(bytes: &[u8]) -> Result<StoredMarker, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}
