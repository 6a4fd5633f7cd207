//! Clock and randomness seen by the engine.
//!
//! The engine never reads the system clock or OS entropy directly. Debounce
//! deadlines, marker timestamps and context request ids all come from an
//! [`Environment`], so simulations drive them from a virtual clock and a
//! seeded RNG.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::{RngCore, rngs::OsRng};

/// Time and randomness source.
///
/// `now()` must be monotonic. Every method is infallible.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Monotonic instant; virtual in simulation.
    type Instant: Copy + Ord + Send + Sync + std::fmt::Debug + std::ops::Sub<Output = Duration>;

    /// Current instant. Never earlier than a previous call.
    fn now(&self) -> Self::Instant;

    /// Wall-clock time in milliseconds since the Unix epoch.
    ///
    /// Only used to stamp markers. Ordering decisions never depend on it.
    fn wall_clock_ms(&self) -> u64;

    /// Fill `buffer` with random bytes. Seeded environments repeat.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    ///
    /// Used for context request IDs.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }
}

/// Production environment backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a system environment.
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_clock_ms(&self) -> u64 {
        // A clock set before 1970 stamps markers with 0
        SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis() as u64)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        OsRng.fill_bytes(buffer);
    }
}

/// Test environments.
pub mod test_utils {
    #![allow(clippy::disallowed_types, reason = "Mock clock state")]

    use std::{
        sync::{Arc, Mutex},
        time::{Duration, Instant},
    };

    use super::Environment;

    /// Wall clock the mock starts at (2023-11-14T22:13:20Z).
    const MOCK_EPOCH_MS: u64 = 1_700_000_000_000;

    /// Manually driven environment for unit tests.
    ///
    /// Time only moves when [`MockEnv::advance`] is called. Random bytes come
    /// from a counter, so runs are reproducible.
    #[derive(Debug, Clone)]
    pub struct MockEnv {
        base: Instant,
        state: Arc<Mutex<MockState>>,
    }

    #[derive(Debug, Default)]
    struct MockState {
        elapsed: Duration,
        counter: u64,
    }

    impl MockEnv {
        /// Create a mock environment at time zero.
        pub fn new() -> Self {
            Self { base: Instant::now(), state: Arc::new(Mutex::new(MockState::default())) }
        }

        /// Move the clock forward.
        ///
        /// # Panics
        ///
        /// Panics if the internal mutex is poisoned.
        #[allow(clippy::expect_used)]
        pub fn advance(&self, duration: Duration) {
            self.state.lock().expect("MockEnv mutex poisoned").elapsed += duration;
        }

        /// Time elapsed since creation.
        ///
        /// # Panics
        ///
        /// Panics if the internal mutex is poisoned.
        #[allow(clippy::expect_used)]
        pub fn elapsed(&self) -> Duration {
            self.state.lock().expect("MockEnv mutex poisoned").elapsed
        }
    }

    impl Default for MockEnv {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Environment for MockEnv {
        type Instant = Instant;

        fn now(&self) -> Instant {
            self.base + self.elapsed()
        }

        fn wall_clock_ms(&self) -> u64 {
            MOCK_EPOCH_MS + self.elapsed().as_millis() as u64
        }

        #[allow(clippy::expect_used)]
        fn random_bytes(&self, buffer: &mut [u8]) {
            let mut state = self.state.lock().expect("MockEnv mutex poisoned");
            for chunk in buffer.chunks_mut(8) {
                state.counter += 1;
                let bytes = state.counter.to_be_bytes();
                chunk.copy_from_slice(&bytes[..chunk.len()]);
            }
        }
    }
}
