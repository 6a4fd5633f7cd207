//! Simulated environment with a virtual clock and seeded randomness.
//!
//! Time only moves when the test calls [`SimEnv::advance`], so debounce and
//! retry behavior is reproducible. Clones share the same clock and RNG.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]

use std::{
    ops::{Add, Sub},
    sync::{Arc, Mutex},
    time::Duration,
};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use readmark_core::Environment;

/// Wall-clock origin of every simulation, in milliseconds since the epoch.
pub const SIM_EPOCH_MS: u64 = 1_700_000_000_000;

/// Virtual instant: time elapsed since the simulation started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SimInstant(Duration);

impl SimInstant {
    /// Time since the simulation started.
    pub fn since_start(self) -> Duration {
        self.0
    }
}

impl Sub for SimInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

impl Add<Duration> for SimInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0 + rhs)
    }
}

struct SimState {
    elapsed: Duration,
    rng: ChaCha8Rng,
}

/// Deterministic [`Environment`] for simulation tests.
#[derive(Clone)]
pub struct SimEnv {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEnv {
    /// Create an environment seeded with 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Create an environment whose RNG is seeded with `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                elapsed: Duration::ZERO,
                rng: ChaCha8Rng::seed_from_u64(seed),
            })),
        }
    }

    /// Move the virtual clock forward.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn advance(&self, duration: Duration) {
        let mut state = self.state.lock().expect("SimEnv mutex poisoned");
        state.elapsed += duration;
    }

    /// Time since the simulation started.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn elapsed(&self) -> Duration {
        self.state.lock().expect("SimEnv mutex poisoned").elapsed
    }
}

impl std::fmt::Debug for SimEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimEnv").field("elapsed", &self.elapsed()).finish_non_exhaustive()
    }
}

impl Environment for SimEnv {
    type Instant = SimInstant;

    fn now(&self) -> SimInstant {
        SimInstant(self.elapsed())
    }

    fn wall_clock_ms(&self) -> u64 {
        SIM_EPOCH_MS + self.elapsed().as_millis() as u64
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        let mut state = self.state.lock().expect("SimEnv mutex poisoned");
        state.rng.fill_bytes(buffer);
    }
}
