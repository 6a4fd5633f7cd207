//! Fault-injecting marker storage
//!
//! Wraps another backend and fails a seeded fraction of calls with
//! [`StorageError::Io`] before they reach it. A failed call never touches the
//! wrapped storage, so every failure is clean: the write did not happen.
//!
//! The read-state engine must keep its in-memory markers correct through
//! these failures and retry the lost writes later.

#![allow(clippy::disallowed_types, reason = "Locking the shared chaos RNG")]

use std::sync::{Arc, Mutex};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{MarkerKey, MarkerStorage, StorageError, StoredMarker};

/// Seed used by [`ChaoticStorage::new`].
const DEFAULT_SEED: u64 = 0x5EED_0F_C4A0_5000;

/// Storage wrapper that randomly fails calls.
///
/// Clones share the RNG and the counters, so an engine and a test holding
/// the same wrapper observe one failure sequence.
#[derive(Clone)]
pub struct ChaoticStorage<S: MarkerStorage> {
    inner: S,
    failure_rate: f64,
    state: Arc<Mutex<ChaosState>>,
}

struct ChaosState {
    rng: ChaCha8Rng,
    operations: usize,
    failures: usize,
}

impl<S: MarkerStorage> ChaoticStorage<S> {
    /// Wrap `inner`, failing calls with probability `failure_rate`.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is outside `0.0..=1.0`.
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, DEFAULT_SEED)
    }

    /// Like [`ChaoticStorage::new`] with an explicit seed, so a failing run
    /// can be replayed.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is outside `0.0..=1.0`.
    #[allow(clippy::panic)]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        let state = ChaosState { rng: ChaCha8Rng::seed_from_u64(seed), operations: 0, failures: 0 };
        Self { inner, failure_rate, state: Arc::new(Mutex::new(state)) }
    }

    /// Wrapped storage, bypassing fault injection.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Calls made through this wrapper, failed or not.
    pub fn operation_count(&self) -> usize {
        self.with_state(|state| state.operations)
    }

    /// Calls that were failed on purpose.
    pub fn failure_count(&self) -> usize {
        self.with_state(|state| state.failures)
    }

    #[allow(clippy::expect_used)]
    fn with_state<T>(&self, f: impl FnOnce(&mut ChaosState) -> T) -> T {
        f(&mut self.state.lock().expect("chaos state mutex poisoned"))
    }

    /// Count a call and decide whether it fails.
    fn roll(&self, operation: &'static str) -> Result<(), StorageError> {
        let failure_rate = self.failure_rate;
        let failed = self.with_state(|state| {
            state.operations += 1;
            let failed = state.rng.gen_bool(failure_rate);
            if failed {
                state.failures += 1;
            }
            failed
        });

        if failed {
            tracing::trace!(operation, "Injected storage failure");
            return Err(StorageError::Io(format!("injected failure in {operation}")));
        }
        Ok(())
    }
}

impl<S: MarkerStorage> MarkerStorage for ChaoticStorage<S> {
    fn store_marker(&self, marker: &StoredMarker) -> Result<(), StorageError> {
        self.roll("store_marker")?;
        self.inner.store_marker(marker)
    }

    fn store_markers(&self, markers: &[StoredMarker]) -> Result<(), StorageError> {
        self.roll("store_markers")?;
        self.inner.store_markers(markers)
    }

    fn load_marker(&self, key: &MarkerKey) -> Result<Option<StoredMarker>, StorageError> {
        self.roll("load_marker")?;
        self.inner.load_marker(key)
    }

    fn load_room_markers(&self, room_id: &str) -> Result<Vec<StoredMarker>, StorageError> {
        self.roll("load_room_markers")?;
        self.inner.load_room_markers(room_id)
    }

    fn list_markers(&self) -> Result<Vec<StoredMarker>, StorageError> {
        self.roll("list_markers")?;
        self.inner.list_markers()
    }

    fn forget_room(&self, room_id: &str) -> Result<usize, StorageError> {
        self.roll("forget_room")?;
        self.inner.forget_room(room_id)
    }
}
