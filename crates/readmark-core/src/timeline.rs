//! Timeline index.
//!
//! Per room: one ordered main timeline plus one ordered timeline per thread.
//! Events are classified on append and never mutated afterwards.
//!
//! # Scopes
//!
//! - `ThreadReply { root }` lives in the thread rooted at `root`. The first
//!   such reply creates the thread scope.
//! - `Edit` and `Reaction` live in the scope of their target, or in the main
//!   timeline when the target is not indexed.
//! - Everything else, including thread roots, lives in the main timeline.
//!
//! # Gaps
//!
//! A limited sync batch means the server skipped events. The index records a
//! gap just before the first new event, in the main timeline and in every
//! thread that existed before the batch. A backfill that covers the missing
//! range removes the gap again. Counting code treats a gap after the read
//! marker as "at least one unread".

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    ops::Bound,
};

use crate::{
    classify::{Classification, Classifier},
    event::{Event, EventContent, Position},
    ids::{EventId, RoomId, ScopeKey},
};

/// An event together with everything the index derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedEvent {
    /// The event as delivered.
    pub event: Event,
    /// Position inside its scope.
    pub position: Position,
    /// Scope the event belongs to.
    pub scope: ScopeKey,
    /// Cached classification.
    pub classification: Classification,
}

impl IndexedEvent {
    /// Whether the event counts as unread.
    pub fn is_countable(&self) -> bool {
        self.classification.is_countable()
    }

    /// Whether the event counts as a highlight.
    pub fn is_highlight(&self) -> bool {
        self.is_countable() && self.event.highlight
    }
}

/// Result of appending a new event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appended {
    /// Appended event.
    pub event_id: EventId,
    /// Scope the event was placed in.
    pub scope: ScopeKey,
    /// Assigned position.
    pub position: Position,
    /// Whether this event created its thread scope.
    pub new_thread: bool,
}

#[derive(Debug, Default)]
struct ScopeTimeline {
    entries: BTreeMap<Position, EventId>,
    /// Sequences immediately after a region of unknown events.
    gaps: BTreeSet<u64>,
}

#[derive(Debug, Default)]
struct RoomTimeline {
    main: ScopeTimeline,
    threads: HashMap<EventId, ScopeTimeline>,
}

impl RoomTimeline {
    fn scope(&self, thread_id: Option<&EventId>) -> Option<&ScopeTimeline> {
        match thread_id {
            Some(root) => self.threads.get(root),
            None => Some(&self.main),
        }
    }
}

/// Ordered, append-only index of every loaded event.
#[derive(Debug)]
pub struct TimelineIndex {
    classifier: Classifier,
    events: HashMap<EventId, IndexedEvent>,
    rooms: HashMap<RoomId, RoomTimeline>,
    next_arrival: u64,
}

impl TimelineIndex {
    /// Create an empty index classifying events with `classifier`.
    pub fn new(classifier: Classifier) -> Self {
        Self { classifier, events: HashMap::new(), rooms: HashMap::new(), next_arrival: 0 }
    }

    /// Classifier used on append.
    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Append a single event.
    ///
    /// Returns `None` if the event id is already indexed. Out-of-order events
    /// are inserted at their sorted position.
    pub fn append(&mut self, event: Event) -> Option<Appended> {
        if self.events.contains_key(&event.event_id) {
            return None;
        }

        let classification = self.classifier.classify(&event);
        let scope = self.resolve_scope(&event);

        let position = Position { sequence: event.sequence, arrival: self.next_arrival };
        self.next_arrival += 1;

        let room = self.rooms.entry(event.room_id.clone()).or_default();
        let (timeline, new_thread) = match &scope.thread_id {
            Some(root) => {
                let new_thread = !room.threads.contains_key(root);
                (room.threads.entry(root.clone()).or_default(), new_thread)
            },
            None => (&mut room.main, false),
        };
        timeline.entries.insert(position, event.event_id.clone());

        tracing::trace!(
            event_id = %event.event_id,
            scope = %scope,
            sequence = position.sequence,
            countable = classification.is_countable(),
            "Indexed event"
        );

        let appended =
            Appended { event_id: event.event_id.clone(), scope: scope.clone(), position, new_thread };

        self.events
            .insert(event.event_id.clone(), IndexedEvent { event, position, scope, classification });

        Some(appended)
    }

    /// Append a sync or backfill batch for `room_id`.
    ///
    /// Events addressed to another room are skipped. When `limited` is set a
    /// gap is recorded before the first new event in the main timeline and in
    /// every thread that existed before the batch.
    pub fn append_batch(
        &mut self,
        room_id: &RoomId,
        events: impl IntoIterator<Item = Event>,
        limited: bool,
    ) -> Vec<Appended> {
        let existing_threads: Vec<EventId> = self
            .rooms
            .get(room_id)
            .map(|room| room.threads.keys().cloned().collect())
            .unwrap_or_default();

        let mut appended = Vec::new();
        for event in events {
            if &event.room_id != room_id {
                tracing::warn!(
                    room_id = %room_id,
                    event_id = %event.event_id,
                    event_room = %event.room_id,
                    "Skipping event addressed to another room"
                );
                continue;
            }
            appended.extend(self.append(event));
        }

        if limited {
            if let Some(first) = appended.iter().map(|a| a.position.sequence).min() {
                let room = self.rooms.entry(room_id.clone()).or_default();
                room.main.gaps.insert(first);
                for root in &existing_threads {
                    if let Some(thread) = room.threads.get_mut(root) {
                        thread.gaps.insert(first);
                    }
                }
                tracing::debug!(
                    room_id = %room_id,
                    sequence = first,
                    threads = existing_threads.len(),
                    "Recorded timeline gap"
                );
            }
        }

        appended
    }

    /// Remove the gap recorded at `sequence` from every scope of `room_id`.
    ///
    /// Returns whether any scope had that gap.
    pub fn fill_gap(&mut self, room_id: &RoomId, sequence: u64) -> bool {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return false;
        };

        let mut filled = room.main.gaps.remove(&sequence);
        for thread in room.threads.values_mut() {
            filled |= thread.gaps.remove(&sequence);
        }

        if filled {
            tracing::debug!(room_id = %room_id, sequence, "Filled timeline gap");
        }
        filled
    }

    /// Sequence of the newest gap in `scope`.
    pub fn last_gap(&self, scope: &ScopeKey) -> Option<u64> {
        self.scope(scope).and_then(|timeline| timeline.gaps.last().copied())
    }

    /// Whether a gap lies after `after_sequence` in `scope`.
    ///
    /// `None` means "from the beginning": any gap in the scope matches.
    pub fn has_gap_after(&self, scope: &ScopeKey, after_sequence: Option<u64>) -> bool {
        let Some(timeline) = self.scope(scope) else {
            return false;
        };

        match after_sequence {
            Some(sequence) => {
                timeline.gaps.range((Bound::Excluded(sequence), Bound::Unbounded)).next().is_some()
            },
            None => !timeline.gaps.is_empty(),
        }
    }

    /// Events of `scope` strictly after `cursor`, in order.
    ///
    /// `None` yields the whole scope. Unknown scopes yield nothing.
    pub fn events_after(
        &self,
        scope: &ScopeKey,
        cursor: Option<Position>,
    ) -> impl Iterator<Item = &IndexedEvent> + '_ {
        let lower = cursor.map_or(Bound::Unbounded, Bound::Excluded);

        self.scope(scope)
            .into_iter()
            .flat_map(move |timeline| timeline.entries.range((lower, Bound::Unbounded)))
            .filter_map(|(_, event_id)| self.events.get(event_id))
    }

    /// Indexed event by id.
    pub fn get(&self, event_id: &EventId) -> Option<&IndexedEvent> {
        self.events.get(event_id)
    }

    /// Position of an indexed event.
    pub fn position_of(&self, event_id: &EventId) -> Option<Position> {
        self.events.get(event_id).map(|e| e.position)
    }

    /// Scope of an indexed event.
    pub fn scope_of(&self, event_id: &EventId) -> Option<&ScopeKey> {
        self.events.get(event_id).map(|e| &e.scope)
    }

    /// Last event of `scope`.
    pub fn latest(&self, scope: &ScopeKey) -> Option<&IndexedEvent> {
        self.scope(scope)
            .and_then(|timeline| timeline.entries.values().next_back())
            .and_then(|event_id| self.events.get(event_id))
    }

    /// Last event of `scope` whose sequence is at most `sequence`.
    pub fn latest_at_or_before(&self, scope: &ScopeKey, sequence: u64) -> Option<&IndexedEvent> {
        self.scope(scope)
            .and_then(|timeline| {
                timeline.entries.range(..=Position::after_sequence(sequence)).next_back()
            })
            .and_then(|(_, event_id)| self.events.get(event_id))
    }

    /// Thread roots of `room_id`, ordered by root position.
    ///
    /// Threads whose root is not indexed are ordered by their first reply.
    pub fn threads(&self, room_id: &RoomId) -> Vec<EventId> {
        let Some(room) = self.rooms.get(room_id) else {
            return Vec::new();
        };

        let mut roots: Vec<(Position, &EventId)> = room
            .threads
            .iter()
            .map(|(root, timeline)| {
                let anchor = self
                    .position_of(root)
                    .or_else(|| timeline.entries.keys().next().copied())
                    .unwrap_or(Position { sequence: u64::MAX, arrival: u64::MAX });
                (anchor, root)
            })
            .collect();
        roots.sort();

        roots.into_iter().map(|(_, root)| root.clone()).collect()
    }

    /// Whether `room_id` has a thread scope rooted at `root`.
    pub fn has_thread(&self, room_id: &RoomId, root: &EventId) -> bool {
        self.rooms.get(room_id).is_some_and(|room| room.threads.contains_key(root))
    }

    /// Whether the root event of a thread is indexed in `room_id`.
    pub fn root_known(&self, room_id: &RoomId, root: &EventId) -> bool {
        self.events.get(root).is_some_and(|e| &e.event.room_id == room_id)
    }

    /// Number of events in `scope`.
    pub fn scope_len(&self, scope: &ScopeKey) -> usize {
        self.scope(scope).map_or(0, |timeline| timeline.entries.len())
    }

    /// Rooms with at least one indexed event.
    pub fn rooms(&self) -> impl Iterator<Item = &RoomId> {
        self.rooms.keys()
    }

    /// Drop every event of `room_id`. Returns how many were removed.
    pub fn forget_room(&mut self, room_id: &RoomId) -> usize {
        if self.rooms.remove(room_id).is_none() {
            return 0;
        }

        let before = self.events.len();
        self.events.retain(|_, e| &e.event.room_id != room_id);
        before - self.events.len()
    }

    /// Total number of indexed events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn scope(&self, scope: &ScopeKey) -> Option<&ScopeTimeline> {
        self.rooms.get(&scope.room_id).and_then(|room| room.scope(scope.thread_id.as_ref()))
    }

    fn resolve_scope(&self, event: &Event) -> ScopeKey {
        match &event.content {
            EventContent::ThreadReply { root } => {
                ScopeKey::thread(event.room_id.clone(), root.clone())
            },
            EventContent::Edit { target } | EventContent::Reaction { target, .. } => self
                .events
                .get(target)
                .filter(|target| target.event.room_id == event.room_id)
                .map_or_else(|| ScopeKey::main(event.room_id.clone()), |target| target.scope.clone()),
            EventContent::Message
            | EventContent::Reply { .. }
            | EventContent::State { .. }
            | EventContent::Other => ScopeKey::main(event.room_id.clone()),
        }
    }
}
