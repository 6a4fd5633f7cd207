//! Timeline events as the engine sees them.
//!
//! Events are immutable input records delivered by the event store. An edit
//! is a new event relating to its target, never a mutation of the target.

use serde::{Deserialize, Serialize};

use crate::ids::{EventId, RoomId, UserId};

/// What an event is, with the relation it carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventContent {
    /// Ordinary message.
    Message,
    /// Main-timeline reply to `target`. Counts like a message.
    Reply {
        /// Event being replied to.
        target: EventId,
    },
    /// Reply inside the thread rooted at `root`.
    ThreadReply {
        /// Thread root.
        root: EventId,
    },
    /// Replacement of `target`.
    Edit {
        /// Event being edited.
        target: EventId,
    },
    /// Annotation of `target`.
    Reaction {
        /// Event being reacted to.
        target: EventId,
        /// Reaction key, usually an emoji.
        key: String,
    },
    /// State or membership change.
    State {
        /// Whether push rules consider this change notifying.
        notify: bool,
    },
    /// Anything else.
    Other,
}

impl EventContent {
    /// Event this content relates to, if any.
    pub fn relates_to(&self) -> Option<&EventId> {
        match self {
            Self::Reply { target } | Self::Edit { target } | Self::Reaction { target, .. } => {
                Some(target)
            },
            Self::ThreadReply { root } => Some(root),
            Self::Message | Self::State { .. } | Self::Other => None,
        }
    }
}

/// A timeline event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique event id.
    pub event_id: EventId,
    /// Room the event was sent to.
    pub room_id: RoomId,
    /// Sender of the event.
    pub sender: UserId,
    /// Server-assigned order, monotonic per room across the main timeline and
    /// all threads.
    pub sequence: u64,
    /// Event payload.
    pub content: EventContent,
    /// Set by the push evaluator when the event highlights the local user.
    pub highlight: bool,
}

impl Event {
    /// Create an event without highlight.
    pub fn new(
        event_id: impl Into<EventId>,
        room_id: impl Into<RoomId>,
        sender: impl Into<UserId>,
        sequence: u64,
        content: EventContent,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            room_id: room_id.into(),
            sender: sender.into(),
            sequence,
            content,
            highlight: false,
        }
    }

    /// Mark the event as highlighting the local user.
    #[must_use]
    pub fn with_highlight(mut self, highlight: bool) -> Self {
        self.highlight = highlight;
        self
    }
}

/// Position of an event inside a scope.
///
/// Ordered by server sequence first. Events sharing a sequence are ordered by
/// arrival at the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Position {
    /// Server-assigned order.
    pub sequence: u64,
    /// Arrival counter of the index that assigned this position.
    pub arrival: u64,
}

impl Position {
    /// Position after every event with `sequence`, whatever its arrival.
    ///
    /// Used as a cursor when only a marker's sequence is known.
    pub fn after_sequence(sequence: u64) -> Self {
        Self { sequence, arrival: u64::MAX }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relations() {
        let target = EventId::from("$t");
        assert_eq!(EventContent::Edit { target: target.clone() }.relates_to(), Some(&target));
        assert_eq!(EventContent::ThreadReply { root: target.clone() }.relates_to(), Some(&target));
        assert_eq!(EventContent::Message.relates_to(), None);
        assert_eq!(EventContent::State { notify: true }.relates_to(), None);
    }

    #[test]
    fn positions_order_by_sequence_then_arrival() {
        let early = Position { sequence: 4, arrival: 9 };
        let tie = Position { sequence: 5, arrival: 1 };
        let late = Position { sequence: 5, arrival: 2 };

        assert!(early < tie);
        assert!(tie < late);
        assert!(late < Position::after_sequence(5));
    }
}
