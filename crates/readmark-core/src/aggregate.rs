//! Unread aggregation.
//!
//! Pure functions over the timeline index and the receipt store. Nothing here
//! is cached: callers recompute a room whenever its events or markers change.
//!
//! # Counting rules
//!
//! - Only countable events strictly after the scope's effective marker count.
//!   A marker covers every event with a sequence up to its own, including
//!   events that share its sequence but arrived later.
//! - A scope without a marker has never been read: every countable event
//!   counts.
//! - A gap after the marker makes the count at least 1 and flags the result
//!   as incomplete. Missing data is never reported as read.
//! - A thread whose root is not indexed reports 0.

use readmark_storage::MarkerStorage;

use crate::{
    event::Position,
    ids::{EventId, RoomId, ScopeKey},
    receipts::ReceiptStore,
    timeline::TimelineIndex,
};

/// Derived read state of one thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSummary {
    /// Thread root.
    pub thread_root_id: EventId,
    /// Countable replies after the thread marker.
    pub unread_count: u64,
    /// Highlighting replies after the thread marker.
    pub highlight_count: u64,
    /// Whether `unread_count > 0`.
    pub has_unread: bool,
    /// Whether the root event is indexed.
    pub root_known: bool,
    /// Whether a gap made the count conservative.
    pub incomplete: bool,
}

/// Derived read state of a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomReadState {
    /// Room this state describes.
    pub room_id: RoomId,
    /// Countable main-timeline events after the main marker. Thread replies
    /// are not included.
    pub main_unread_count: u64,
    /// Highlighting main-timeline events after the main marker.
    pub main_highlight_count: u64,
    /// Per-thread summaries, ordered by root position.
    pub threads: Vec<ThreadSummary>,
    /// Badge count: main timeline plus every thread.
    pub unread_count: u64,
    /// Badge highlight count: main timeline plus every thread.
    pub highlight_count: u64,
    /// Main timeline unread or any thread unread.
    pub is_room_unread: bool,
    /// Whether any count was made conservative by a gap.
    pub incomplete: bool,
}

impl RoomReadState {
    /// Summary of the thread rooted at `root`.
    pub fn thread(&self, root: &EventId) -> Option<&ThreadSummary> {
        self.threads.iter().find(|t| &t.thread_root_id == root)
    }

    /// Threads with unread replies.
    pub fn unread_threads(&self) -> impl Iterator<Item = &ThreadSummary> {
        self.threads.iter().filter(|t| t.has_unread)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ScopeCount {
    unread: u64,
    highlight: u64,
    incomplete: bool,
}

fn count_scope<S: MarkerStorage>(
    timeline: &TimelineIndex,
    receipts: &ReceiptStore<S>,
    scope: &ScopeKey,
) -> ScopeCount {
    let marker = receipts.get_marker(scope);

    // Markers only carry a sequence, so events sharing it are read together
    let cursor = marker.map(|m| Position::after_sequence(m.sequence));

    let mut count = ScopeCount::default();
    for event in timeline.events_after(scope, cursor) {
        if event.is_countable() {
            count.unread += 1;
            if event.is_highlight() {
                count.highlight += 1;
            }
        }
    }

    if timeline.has_gap_after(scope, marker.map(|m| m.sequence)) {
        count.incomplete = true;
        count.unread = count.unread.max(1);
    }

    count
}

/// Summary of the thread rooted at `root` in `room_id`.
///
/// Returns `None` when the room has no such thread and the root is not
/// indexed either.
pub fn compute_thread_summary<S: MarkerStorage>(
    timeline: &TimelineIndex,
    receipts: &ReceiptStore<S>,
    room_id: &RoomId,
    root: &EventId,
) -> Option<ThreadSummary> {
    let root_known = timeline.root_known(room_id, root);
    if !root_known && !timeline.has_thread(room_id, root) {
        return None;
    }

    let count = if root_known {
        count_scope(timeline, receipts, &ScopeKey::thread(room_id.clone(), root.clone()))
    } else {
        ScopeCount::default()
    };

    Some(ThreadSummary {
        thread_root_id: root.clone(),
        unread_count: count.unread,
        highlight_count: count.highlight,
        has_unread: count.unread > 0,
        root_known,
        incomplete: count.incomplete,
    })
}

/// Read state of `room_id`.
pub fn compute_room_read_state<S: MarkerStorage>(
    timeline: &TimelineIndex,
    receipts: &ReceiptStore<S>,
    room_id: &RoomId,
) -> RoomReadState {
    let main = count_scope(timeline, receipts, &ScopeKey::main(room_id.clone()));

    let threads: Vec<ThreadSummary> = timeline
        .threads(room_id)
        .iter()
        .filter_map(|root| compute_thread_summary(timeline, receipts, room_id, root))
        .collect();

    let thread_unread: u64 = threads.iter().map(|t| t.unread_count).sum();
    let thread_highlight: u64 = threads.iter().map(|t| t.highlight_count).sum();
    let any_thread_unread = threads.iter().any(|t| t.has_unread);
    let any_thread_incomplete = threads.iter().any(|t| t.incomplete);

    RoomReadState {
        room_id: room_id.clone(),
        main_unread_count: main.unread,
        main_highlight_count: main.highlight,
        unread_count: main.unread + thread_unread,
        highlight_count: main.highlight + thread_highlight,
        is_room_unread: main.unread > 0 || any_thread_unread,
        incomplete: main.incomplete || any_thread_incomplete,
        threads,
    }
}

#[cfg(test)]
mod tests {
    use readmark_storage::MemoryStorage;

    use super::*;
    use crate::{
        classify::Classifier,
        config::EngineConfig,
        event::{Event, EventContent},
        ids::UserId,
        receipts::ReceiptKind,
    };

    const ROOM: &str = "!room:hs";
    const BOT: &str = "@bot:hs";

    struct Fixture {
        timeline: TimelineIndex,
        receipts: ReceiptStore<MemoryStorage>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                timeline: TimelineIndex::new(Classifier::new(
                    UserId::from("@me:hs"),
                    &EngineConfig::default(),
                )),
                receipts: ReceiptStore::open(MemoryStorage::new()).unwrap(),
            }
        }

        fn push(&mut self, id: &str, sequence: u64, content: EventContent) {
            self.timeline.append(Event::new(id, ROOM, BOT, sequence, content));
        }

        fn read(&mut self, scope: ScopeKey, id: &str) {
            let sequence = self.timeline.position_of(&EventId::from(id)).unwrap().sequence;
            self.receipts.set_marker(&scope, &EventId::from(id), sequence, ReceiptKind::Private, 0);
        }

        fn state(&self) -> RoomReadState {
            compute_room_read_state(&self.timeline, &self.receipts, &room())
        }
    }

    fn room() -> RoomId {
        RoomId::from(ROOM)
    }

    fn thread(root: &str) -> ScopeKey {
        ScopeKey::thread(room(), EventId::from(root))
    }

    #[test]
    fn never_read_room_counts_everything() {
        let mut f = Fixture::new();
        f.push("$a", 1, EventContent::Message);
        f.push("$b", 2, EventContent::Message);

        let state = f.state();
        assert_eq!(state.main_unread_count, 2);
        assert!(state.is_room_unread);
    }

    #[test]
    fn marker_hides_earlier_events() {
        let mut f = Fixture::new();
        f.push("$a", 1, EventContent::Message);
        f.push("$b", 2, EventContent::Message);
        f.read(ScopeKey::main(room()), "$a");

        assert_eq!(f.state().main_unread_count, 1);

        f.read(ScopeKey::main(room()), "$b");
        let state = f.state();
        assert_eq!(state.main_unread_count, 0);
        assert!(!state.is_room_unread);
    }

    #[test]
    fn thread_replies_count_toward_their_thread_only() {
        let mut f = Fixture::new();
        f.push("$root", 1, EventContent::Message);
        f.push("$r1", 2, EventContent::ThreadReply { root: "$root".into() });
        f.push("$r2", 3, EventContent::ThreadReply { root: "$root".into() });

        let state = f.state();
        assert_eq!(state.main_unread_count, 1);
        assert_eq!(state.unread_count, 3);

        f.read(ScopeKey::main(room()), "$root");
        let state = f.state();
        assert_eq!(state.main_unread_count, 0);
        assert_eq!(state.unread_count, 2);
        assert!(state.is_room_unread);

        let summary = state.thread(&EventId::from("$root")).unwrap();
        assert_eq!(summary.unread_count, 2);
        assert!(summary.has_unread);

        f.read(thread("$root"), "$r2");
        let state = f.state();
        assert_eq!(state.unread_count, 0);
        assert!(!state.is_room_unread);
    }

    #[test]
    fn reactions_and_edits_do_not_count() {
        let mut f = Fixture::new();
        f.push("$a", 1, EventContent::Message);
        f.read(ScopeKey::main(room()), "$a");

        f.push("$react", 2, EventContent::Reaction { target: "$a".into(), key: "👍".into() });
        f.push("$edit", 3, EventContent::Edit { target: "$a".into() });

        let state = f.state();
        assert_eq!(state.unread_count, 0);
        assert!(!state.is_room_unread);
    }

    #[test]
    fn unknown_root_reports_zero() {
        let mut f = Fixture::new();
        f.push("$r1", 2, EventContent::ThreadReply { root: "$ghost".into() });

        let state = f.state();
        let summary = state.thread(&EventId::from("$ghost")).unwrap();
        assert!(!summary.root_known);
        assert_eq!(summary.unread_count, 0);
        assert!(!state.is_room_unread);

        // Root arrives through backfill: the thread counts again
        f.push("$ghost", 1, EventContent::Message);
        let state = f.state();
        assert_eq!(state.thread(&EventId::from("$ghost")).unwrap().unread_count, 1);
    }

    #[test]
    fn gap_after_marker_is_conservative() {
        let mut f = Fixture::new();
        f.push("$a", 1, EventContent::Message);
        f.read(ScopeKey::main(room()), "$a");

        // Only our own event made it into the limited batch
        f.timeline.append_batch(
            &room(),
            vec![Event::new("$mine", ROOM, "@me:hs", 50, EventContent::Message)],
            true,
        );

        let state = f.state();
        assert_eq!(state.main_unread_count, 1);
        assert!(state.incomplete);

        f.read(ScopeKey::main(room()), "$mine");
        let state = f.state();
        assert_eq!(state.main_unread_count, 0);
        assert!(!state.incomplete);
    }

    #[test]
    fn highlights_are_counted_separately() {
        let mut f = Fixture::new();
        f.timeline.append(Event::new("$a", ROOM, BOT, 1, EventContent::Message).with_highlight(true));
        f.push("$b", 2, EventContent::Message);

        let state = f.state();
        assert_eq!(state.main_unread_count, 2);
        assert_eq!(state.main_highlight_count, 1);
        assert_eq!(state.highlight_count, 1);
    }

    #[test]
    fn marker_for_unloaded_event_uses_its_sequence() {
        let mut f = Fixture::new();
        f.receipts.set_marker(
            &ScopeKey::main(room()),
            &EventId::from("$old"),
            10,
            ReceiptKind::Private,
            0,
        );
        f.push("$before", 9, EventContent::Message);
        f.push("$after", 11, EventContent::Message);

        assert_eq!(f.state().main_unread_count, 1);
    }

    #[test]
    fn marker_covers_later_arrivals_with_its_sequence() {
        let mut f = Fixture::new();
        f.push("$first", 5, EventContent::Message);
        f.read(ScopeKey::main(room()), "$first");

        f.push("$second", 5, EventContent::Message);
        f.push("$next", 6, EventContent::Message);

        assert_eq!(f.state().main_unread_count, 1);
    }

    #[test]
    fn missing_thread_has_no_summary() {
        let f = Fixture::new();
        assert!(
            compute_thread_summary(&f.timeline, &f.receipts, &room(), &EventId::from("$x"))
                .is_none()
        );
    }
}
