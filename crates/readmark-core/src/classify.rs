//! Event classification.
//!
//! Every event is classified once, when the timeline index first sees it.
//! The result is cached next to the event and never recomputed.

use crate::{
    config::EngineConfig,
    event::{Event, EventContent},
    ids::UserId,
};

/// Closed set of event categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    /// Ordinary message or main-timeline reply.
    Message,
    /// Replacement of an earlier event.
    Edit,
    /// Annotation of an earlier event.
    Reaction,
    /// Reply inside a thread.
    ThreadReply,
    /// State changes and everything else.
    Other,
}

/// Whether an event increments an unread counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Countability {
    /// Counts as unread while after the scope's marker.
    Countable,
    /// Never counts.
    NotCountable,
}

/// Classification result cached per event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Event category.
    pub category: EventCategory,
    /// Countability for the local user.
    pub countability: Countability,
}

impl Classification {
    /// Whether the event counts as unread.
    pub fn is_countable(&self) -> bool {
        self.countability == Countability::Countable
    }
}

/// Classifies events for one local user.
#[derive(Debug, Clone)]
pub struct Classifier {
    own_user: UserId,
    count_edits: bool,
    count_notifying_state_events: bool,
}

impl Classifier {
    /// Create a classifier for `own_user` using the counting rules in `config`.
    pub fn new(own_user: UserId, config: &EngineConfig) -> Self {
        Self {
            own_user,
            count_edits: config.count_edits,
            count_notifying_state_events: config.count_notifying_state_events,
        }
    }

    /// Local user this classifier was built for.
    pub fn own_user(&self) -> &UserId {
        &self.own_user
    }

    /// Classify `event`.
    ///
    /// Events sent by the local user never count, whatever their category.
    /// Reactions never count. Edits count only when configured to.
    pub fn classify(&self, event: &Event) -> Classification {
        let (category, counts) = match &event.content {
            EventContent::Message | EventContent::Reply { .. } => (EventCategory::Message, true),
            EventContent::ThreadReply { .. } => (EventCategory::ThreadReply, true),
            EventContent::Edit { .. } => (EventCategory::Edit, self.count_edits),
            EventContent::Reaction { .. } => (EventCategory::Reaction, false),
            EventContent::State { notify } => {
                (EventCategory::Other, *notify && self.count_notifying_state_events)
            },
            EventContent::Other => (EventCategory::Other, false),
        };

        let countability = if counts && event.sender != self.own_user {
            Countability::Countable
        } else {
            Countability::NotCountable
        };

        Classification { category, countability }
    }
}
