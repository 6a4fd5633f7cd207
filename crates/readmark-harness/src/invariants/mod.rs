//! Read-state invariants checked after every simulated step.
//!
//! A [`SystemSnapshot`] captures the engine's counts, effective markers and
//! the contents of its storage. Each [`Invariant`] inspects one snapshot and
//! reports a [`Violation`] if the relationship it guards is broken. The model
//! and fuzz tests run [`InvariantRegistry::standard`] after each operation.
//!
//! ```ignore
//! let snapshot = SystemSnapshot::capture(&engine, rooms);
//! InvariantRegistry::standard().assert_all(&snapshot, "after sync");
//! ```

mod checks;
mod snapshot;

pub use checks::{
    MarkerMonotonicity, PersistedMarkersMatch, RoomUnreadConsistency, TotalMatchesBreakdown,
    UnknownRootsAreRead,
};
pub use snapshot::{MarkerSlot, SystemSnapshot};

/// Outcome of one invariant check.
pub type InvariantResult = Result<(), Violation>;

/// A broken invariant.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Which invariant failed.
    pub invariant: &'static str,
    /// Rooms, scopes and values involved.
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// A property of the read state that holds after any sequence of operations.
pub trait Invariant: Send + Sync {
    /// Name used in violation reports.
    fn name(&self) -> &'static str;

    /// Inspect `state`.
    fn check(&self, state: &SystemSnapshot) -> InvariantResult;
}

/// Ordered set of invariants run together against one snapshot.
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl Default for InvariantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantRegistry {
    /// Registry with no checks.
    pub fn new() -> Self {
        Self { invariants: Vec::new() }
    }

    /// Every read-state invariant:
    /// - [`RoomUnreadConsistency`]: room unread iff main or a thread is
    /// - [`TotalMatchesBreakdown`]: badge counts sum main and threads
    /// - [`UnknownRootsAreRead`]: threads with unknown roots count 0
    /// - [`MarkerMonotonicity`]: effective markers never decrease
    /// - [`PersistedMarkersMatch`]: flushed markers equal stored markers
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(RoomUnreadConsistency);
        registry.add(TotalMatchesBreakdown);
        registry.add(UnknownRootsAreRead);
        registry.add(MarkerMonotonicity);
        registry.add(PersistedMarkersMatch);
        registry
    }

    /// Register another check.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Run every check, collecting all violations rather than stopping at
    /// the first.
    pub fn check_all(&self, state: &SystemSnapshot) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> =
            self.invariants.iter().filter_map(|inv| inv.check(state).err()).collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Run every check and fail the test on any violation.
    ///
    /// # Panics
    ///
    /// Panics listing every violation found.
    #[allow(clippy::panic)]
    pub fn assert_all(&self, state: &SystemSnapshot, context: &str) {
        if let Err(violations) = self.check_all(state) {
            let messages: Vec<_> = violations.iter().map(ToString::to_string).collect();
            panic!("Invariant violation {context}:\n  {}", messages.join("\n  "));
        }
    }

    /// Registered checks.
    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    /// Whether no checks are registered.
    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }
}
