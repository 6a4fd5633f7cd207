//! Deterministic simulation harness for readmark read-state testing.
//!
//! Simulated implementations of the engine's environment and of a
//! homeserver, for deterministic, reproducible tests of read tracking across
//! rooms, threads and restarts.
//!
//! # Scenario Testing
//!
//! [`Scenario`] drives one engine through user actions ("go to room1", "open
//! the thread of Msg1") against a [`SimHomeserver`] and asserts what the
//! room list would show.
//!
//! # Model Testing
//!
//! [`ModelWorld`] is a deliberately naive unread counter. Random
//! [`Operation`] sequences run against both the model and a [`Scenario`],
//! and the counts they report must agree.
//!
//! # Invariants
//!
//! [`InvariantRegistry::standard`] holds the properties every snapshot of
//! the engine must satisfy, whatever happened before it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod invariants;
pub mod model;
pub mod scenario;
pub mod sim_env;
pub mod sim_homeserver;

pub use invariants::{
    Invariant, InvariantRegistry, InvariantResult, MarkerMonotonicity, MarkerSlot,
    PersistedMarkersMatch, RoomUnreadConsistency, SystemSnapshot, TotalMatchesBreakdown,
    UnknownRootsAreRead, Violation,
};
pub use model::{
    MODEL_ROOMS, ModelRoomId, ModelWorld, ObservableState, Operation, Resolved, RoomObservation,
    Step, room_name,
};
pub use scenario::{BOT_USER, OTHER_USER, OWN_USER, Scenario};
pub use sim_env::{SIM_EPOCH_MS, SimEnv, SimInstant};
pub use sim_homeserver::{
    MessageSpec, ServerReceipt, SimError, SimHomeserver, edit_of, many, reaction_to, reply_to,
    threaded_off,
};

/// Install a `tracing` subscriber for tests.
///
/// Honors `RUST_LOG` and defaults to `warn`. Safe to call from every test;
/// only the first call installs anything.
pub fn init_test_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    // Another test may have installed one already
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(filter)
        .try_init();
}
