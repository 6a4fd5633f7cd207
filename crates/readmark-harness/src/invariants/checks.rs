//! Standard invariant checks.
//!
//! These invariants capture behavioral properties that must always hold.
//! They verify WHAT must be true, not specific test scenarios.

use super::{Invariant, InvariantResult, SystemSnapshot, Violation};

/// A room is unread exactly when its main timeline or a thread is unread.
pub struct RoomUnreadConsistency;

impl Invariant for RoomUnreadConsistency {
    fn name(&self) -> &'static str {
        "room_unread_consistency"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for room in &state.rooms {
            let any_thread = room.threads.iter().any(|t| t.has_unread);
            let expected = room.main_unread_count > 0 || any_thread;
            if room.is_room_unread != expected {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "room {}: is_room_unread={} but main={} unread_threads={}",
                        room.room_id,
                        room.is_room_unread,
                        room.main_unread_count,
                        room.unread_threads().count()
                    ),
                });
            }

            for thread in &room.threads {
                if thread.has_unread != (thread.unread_count > 0) {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "room {} thread {}: has_unread={} with count {}",
                            room.room_id, thread.thread_root_id, thread.has_unread,
                            thread.unread_count
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Badge counts are the sum of the main timeline and every thread.
pub struct TotalMatchesBreakdown;

impl Invariant for TotalMatchesBreakdown {
    fn name(&self) -> &'static str {
        "total_matches_breakdown"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for room in &state.rooms {
            let unread: u64 = room.threads.iter().map(|t| t.unread_count).sum();
            let highlight: u64 = room.threads.iter().map(|t| t.highlight_count).sum();

            if room.unread_count != room.main_unread_count + unread {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "room {}: unread_count {} != main {} + threads {}",
                        room.room_id, room.unread_count, room.main_unread_count, unread
                    ),
                });
            }
            if room.highlight_count != room.main_highlight_count + highlight {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "room {}: highlight_count {} != main {} + threads {}",
                        room.room_id, room.highlight_count, room.main_highlight_count, highlight
                    ),
                });
            }
            if room.highlight_count > room.unread_count {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "room {}: {} highlights exceed {} unread",
                        room.room_id, room.highlight_count, room.unread_count
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Threads whose root is not indexed report nothing unread.
pub struct UnknownRootsAreRead;

impl Invariant for UnknownRootsAreRead {
    fn name(&self) -> &'static str {
        "unknown_roots_are_read"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for room in &state.rooms {
            for thread in room.threads.iter().filter(|t| !t.root_known) {
                if thread.unread_count > 0 {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "room {} thread {}: root unknown but {} unread",
                            room.room_id, thread.thread_root_id, thread.unread_count
                        ),
                    });
                }
            }

            let known = state.thread_roots.get(&room.room_id);
            for thread in &room.threads {
                let indexed = known
                    .and_then(|roots| roots.iter().find(|(root, _)| root == &thread.thread_root_id))
                    .map(|(_, indexed)| *indexed);
                if indexed.is_some_and(|indexed| indexed != thread.root_known) {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "room {} thread {}: root_known={} disagrees with the index",
                            room.room_id, thread.thread_root_id, thread.root_known
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Effective markers never move backwards.
pub struct MarkerMonotonicity;

impl Invariant for MarkerMonotonicity {
    fn name(&self) -> &'static str {
        "marker_monotonicity"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for (scope, history) in &state.marker_history {
            for window in history.windows(2) {
                if window[1] < window[0] {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "scope {scope}: marker moved back {} -> {}",
                            window[0], window[1]
                        ),
                    });
                }
            }
        }

        let effective = state.effective_markers();
        for (scope, history) in &state.marker_history {
            let (Some(last), Some(current)) = (history.last(), effective.get(scope)) else {
                continue;
            };
            if current < last {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("scope {scope}: marker at {current} after reaching {last}"),
                });
            }
        }
        Ok(())
    }
}

/// Storage holds every flushed marker and never runs ahead of memory.
pub struct PersistedMarkersMatch;

impl Invariant for PersistedMarkersMatch {
    fn name(&self) -> &'static str {
        "persisted_markers_match"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for (slot, sequence) in &state.markers {
            let persisted = state.persisted.get(slot).copied();

            if persisted.is_some_and(|p| p > *sequence) {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "scope {} {:?}: storage at {persisted:?} ahead of memory {sequence}",
                        slot.0, slot.1
                    ),
                });
            }

            if !state.unflushed.contains(slot) && persisted != Some(*sequence) {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "scope {} {:?}: flushed marker {sequence} persisted as {persisted:?}",
                        slot.0, slot.1
                    ),
                });
            }
        }
        Ok(())
    }
}
